//! Lifecycle events and the listeners a task's owner registers for them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use super::task::TaskHandle;
use crate::control::panic_message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Enqueue,
    Dequeue,
    Running,
    Exit,
    Finished,
    Error,
    TimedOut,
    Canceled,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskEvent::Enqueue => "enqueue",
            TaskEvent::Dequeue => "dequeue",
            TaskEvent::Running => "running",
            TaskEvent::Exit => "exit",
            TaskEvent::Finished => "finished",
            TaskEvent::Error => "error",
            TaskEvent::TimedOut => "timed_out",
            TaskEvent::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Observer of task lifecycle events. Errors and panics are logged per listener
/// and never reach other listeners or the queue.
pub trait TaskListener: Send + Sync {
    fn on_event(&self, task: &TaskHandle, event: TaskEvent) -> anyhow::Result<()>;
}

impl<F> TaskListener for F
where
    F: Fn(&TaskHandle, TaskEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, task: &TaskHandle, event: TaskEvent) -> anyhow::Result<()> {
        self(task, event)
    }
}

pub(crate) fn notify(listener: &dyn TaskListener, task: &TaskHandle, event: TaskEvent) {
    match catch_unwind(AssertUnwindSafe(|| listener.on_event(task, event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(task_id = %task.id(), %event, "task hook failed: {:#}", e);
        }
        Err(panic) => {
            tracing::error!(
                task_id = %task.id(),
                %event,
                "task hook panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }
}
