//! Scheduling strategies.
//!
//! A strategy maps the previous scheduled time of a task to the number of
//! ticks that were missed and the next time the task should run (`None` when
//! the task must not run again). Strategies carry no mutable state.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::fmt;
use std::time::Duration;

/// Coarse classification of a strategy, used by the queue's uniqueness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Immediate,
    At(DateTime<Utc>),
    Interval,
    /// Strategies defined outside this module; never considered conflicting.
    Custom,
}

pub trait Schedule: fmt::Debug + Send + Sync {
    /// Returns `(missed_ticks, next_time)` given the previous scheduled time.
    fn schedule(&self, previous: Option<DateTime<Utc>>) -> (u32, Option<DateTime<Utc>>);

    fn kind(&self) -> ScheduleKind {
        ScheduleKind::Custom
    }
}

/// Run once, now.
#[derive(Debug, Clone, Copy, Default)]
pub struct Immediate;

impl Schedule for Immediate {
    fn schedule(&self, previous: Option<DateTime<Utc>>) -> (u32, Option<DateTime<Utc>>) {
        match previous {
            None => (0, Some(Utc::now())),
            Some(_) => (0, None),
        }
    }

    fn kind(&self) -> ScheduleKind {
        ScheduleKind::Immediate
    }
}

/// Run once at a fixed time. A time already in the past is never scheduled.
#[derive(Debug, Clone, Copy)]
pub struct At {
    pub time: DateTime<Utc>,
}

impl At {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self { time }
    }
}

impl Schedule for At {
    fn schedule(&self, previous: Option<DateTime<Utc>>) -> (u32, Option<DateTime<Utc>>) {
        if previous.is_some() || self.time < Utc::now() {
            return (0, None);
        }
        (0, Some(self.time))
    }

    fn kind(&self) -> ScheduleKind {
        ScheduleKind::At(self.time)
    }
}

/// Run repeatedly every `interval`, starting at `start` (or now).
#[derive(Debug, Clone, Copy)]
pub struct Interval {
    pub interval: Duration,
    pub start: Option<DateTime<Utc>>,
}

impl Interval {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            start: None,
        }
    }

    pub fn starting_at(interval: Duration, start: DateTime<Utc>) -> Self {
        Self {
            interval,
            start: Some(start),
        }
    }

    fn step(&self) -> ChronoDuration {
        // Zero intervals would never advance past `now`.
        let step = ChronoDuration::from_std(self.interval)
            .unwrap_or_else(|_| ChronoDuration::days(365 * 100));
        step.max(ChronoDuration::milliseconds(1))
    }
}

impl Schedule for Interval {
    fn schedule(&self, previous: Option<DateTime<Utc>>) -> (u32, Option<DateTime<Utc>>) {
        let now = Utc::now();
        let step = self.step();
        let mut missed = 0u32;
        let mut next = match previous {
            None => match self.start {
                None => return (0, Some(now)),
                Some(start) if start >= now => return (0, Some(start)),
                Some(start) => start,
            },
            Some(previous) => previous,
        };
        // A first run from a past start only advances; it does not count as missed.
        let counting = previous.is_some();
        if counting {
            next = match next.checked_add_signed(step) {
                Some(t) => t,
                None => return (0, None),
            };
        }
        while next < now {
            next = match next.checked_add_signed(step) {
                Some(t) => t,
                None => return (missed, None),
            };
            if counting {
                missed = missed.saturating_add(1);
            }
        }
        (missed, Some(next))
    }

    fn kind(&self) -> ScheduleKind {
        ScheduleKind::Interval
    }
}
