//! Weight budget shared by running tasks.
//!
//! The queue reserves a task's full weight before starting it and releases it
//! when the task completes, so the total weight of running tasks never exceeds
//! `max_total`.

use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug)]
pub struct WeightBudget {
    max_total: usize,
    in_use: AtomicUsize,
}

impl WeightBudget {
    pub fn new(max_total: usize) -> Self {
        Self {
            max_total: max_total.max(1),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn max_total(&self) -> usize {
        self.max_total
    }

    /// Weight currently reserved by running tasks.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn available(&self) -> usize {
        self.max_total.saturating_sub(self.in_use())
    }

    /// Reserve exactly `weight` units, or nothing. Partial reservations are never made.
    pub fn try_reserve(&self, weight: usize) -> bool {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if self.max_total.saturating_sub(current) < weight {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + weight,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return `weight` units previously reserved with `try_reserve`.
    pub fn release(&self, weight: usize) {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(weight);
            match self
                .in_use
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}
