//! Errors surfaced by the task queue to its callers.

/// Scheduling, uniqueness, and thread-state failures.
///
/// `Unscheduled` and `NonUnique` reach the caller of `enqueue`/`schedule`.
/// `ThreadState` is produced when an interrupt cannot be delivered right now;
/// the dispatcher turns it into a retry on the next tick.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("{task} will not be scheduled: {reason}")]
    Unscheduled { task: String, reason: String },

    #[error("{task} [{schedule}] conflicts with {existing} [{existing_schedule}] and cannot be enqueued")]
    NonUnique {
        task: String,
        schedule: String,
        existing: String,
        existing_schedule: String,
    },

    #[error("{task} cannot be interrupted at this time: {reason}")]
    ThreadState { task: String, reason: &'static str },
}

impl TaskError {
    pub fn is_unscheduled(&self) -> bool {
        matches!(self, TaskError::Unscheduled { .. })
    }
}
