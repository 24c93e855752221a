//! Cooperative cancellation for catalog refresh and batch downloads.
//!
//! A `CancelFlag` is shared between the caller and the refresh/download
//! machinery. Setting it stops new work from being started; anything already
//! handed to a worker thread is allowed to finish. This is independent of the
//! interruption mechanism used by the task queue (`tasking::TaskContext`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared cancel flag. Cheap to clone; all clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    flag: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
///
/// Work and listener panics are caught and logged; the state guarded by these
/// mutexes stays consistent across them, so poisoning is not fatal.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
