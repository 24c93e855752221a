//! Dispatcher loop: start ready tasks, deliver cancels and timeouts, cull.

use chrono::{Duration as ChronoDuration, Utc};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::control::panic_message;
use super::queue::{QueueState, Shared};
use super::storage::RunningTask;
use super::task::TaskHandle;
use super::thread::{Delivery, TaskThread};

/// Work decided under the queue lock but carried out after releasing it,
/// because settling a task re-enters the queue through its completion callback.
enum Settle {
    Cancel(TaskHandle),
    CancelWaiting(TaskHandle),
    TimedOut(TaskHandle),
    SpawnFailed(TaskHandle, String),
}

pub(super) fn dispatch_loop(shared: Arc<Shared>) {
    tracing::debug!("task dispatcher started");
    loop {
        {
            let mut state = shared.lock();
            if !state.wake && !state.exit {
                state = shared.wait(state);
            }
            if state.exit {
                break;
            }
            state.wake = false;
        }
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| tick(&shared))) {
            tracing::error!(
                critical = true,
                "task dispatcher tick failed: {}",
                panic_message(panic.as_ref())
            );
        }
    }
    tracing::debug!("task dispatcher stopped");
}

fn tick(shared: &Arc<Shared>) {
    let mut settle = Vec::new();
    {
        let mut state = shared.lock();
        start_ready(shared, &mut state, &mut settle);
        deliver_cancels(&mut state, &mut settle);
        deliver_timeouts(&state, &mut settle);
        cull_complete(shared, &mut state);
    }
    for action in settle {
        match action {
            Settle::Cancel(task) => {
                task.canceled();
            }
            Settle::CancelWaiting(task) => {
                task.cancel_waiting();
            }
            Settle::TimedOut(task) => {
                task.timed_out();
            }
            Settle::SpawnFailed(task, message) => {
                task.abort_start(message);
            }
        }
    }
}

/// Start waiting tasks in schedule order while they are due and fit the budget.
/// Stops at the first task that does not fit; later tasks never jump ahead.
fn start_ready(shared: &Shared, state: &mut QueueState, settle: &mut Vec<Settle>) {
    let now = Utc::now();
    loop {
        let Some(next) = state.stores.waiting.peek() else {
            break;
        };
        if !next.admitted || next.key.is_some_and(|t| t > now) {
            break;
        }
        if !shared.budget.try_reserve(next.task.weight()) {
            break;
        }
        let Some(task) = state.stores.waiting.pop_front() else {
            break;
        };
        match TaskThread::spawn(task.clone()) {
            Ok(thread) => {
                tracing::debug!(
                    task_id = %task.id(),
                    weight = task.weight(),
                    running_weight = shared.budget.in_use(),
                    "task started"
                );
                state.stores.running.insert(
                    task.id(),
                    RunningTask {
                        task,
                        thread: Some(thread),
                    },
                );
            }
            Err(e) => {
                tracing::error!(task_id = %task.id(), "failed to spawn task thread: {}", e);
                state.stores.running.insert(
                    task.id(),
                    RunningTask {
                        task: task.clone(),
                        thread: None,
                    },
                );
                settle.push(Settle::SpawnFailed(task, format!("failed to spawn task thread: {}", e)));
            }
        }
    }
}

fn deliver_cancels(state: &mut QueueState, settle: &mut Vec<Settle>) {
    let pending = std::mem::take(&mut state.canceled);
    for task in pending {
        if let Some(running) = state.stores.running.get(&task.id()) {
            let Some(thread) = &running.thread else {
                continue;
            };
            match thread.cancel(&task) {
                Ok(Delivery::Raised) => {
                    tracing::debug!(task_id = %task.id(), "cancel delivered");
                }
                Ok(Delivery::SettleNow) => settle.push(Settle::Cancel(task)),
                Ok(Delivery::TooLate) => {
                    tracing::debug!(task_id = %task.id(), "task finished before cancel was delivered");
                }
                Err(e) => {
                    let attempts = task.note_cancel_attempt();
                    tracing::warn!(
                        task_id = %task.id(),
                        attempts,
                        "{}; cancel will be retried on the next dispatch",
                        e
                    );
                    state.canceled.push(task);
                }
            }
        } else if let Some(task) = state.stores.waiting.remove(task.id()) {
            settle.push(Settle::CancelWaiting(task));
        } else {
            tracing::debug!(task_id = %task.id(), "task is no longer queued; dropping cancel");
        }
    }
}

fn deliver_timeouts(state: &QueueState, settle: &mut Vec<Settle>) {
    let now = Utc::now();
    for running in state.stores.running.values() {
        let task = &running.task;
        let (Some(timeout), Some(thread)) = (task.timeout(), &running.thread) else {
            continue;
        };
        // Not started yet: the execution thread has not reached `run`.
        let Some(started) = task.start_time() else {
            continue;
        };
        let elapsed = (now - started).to_std().unwrap_or_default();
        if elapsed < timeout {
            continue;
        }
        match thread.timeout(task) {
            Ok(Delivery::Raised) => {
                tracing::debug!(task_id = %task.id(), ?elapsed, "timeout delivered");
            }
            Ok(Delivery::SettleNow) => settle.push(Settle::TimedOut(task.clone())),
            Ok(Delivery::TooLate) => {}
            Err(e) => {
                tracing::debug!(task_id = %task.id(), "{}; timeout will be retried", e);
            }
        }
    }
}

/// Drop complete tasks whose finish time is older than the retention window.
fn cull_complete(shared: &Shared, state: &mut QueueState) {
    let lifetime = ChronoDuration::from_std(shared.options.finished_lifetime)
        .unwrap_or_else(|_| ChronoDuration::days(365 * 100));
    let now = Utc::now();
    state.stores.complete.retain(|id, task| {
        let keep = task.finish_time().map_or(true, |finished| now - finished < lifetime);
        if !keep {
            tracing::debug!(task_id = %id, "culling complete task");
        }
        keep
    });
}
