//! Execution thread wrapper: one detached OS thread per running task.

use std::io;
use std::sync::Arc;
use std::thread;

use super::error::TaskError;
use super::hooks::TaskEvent;
use super::task::{TaskHandle, TaskKind};
use super::work::{Interrupt, InterruptKind};

/// How an interrupt was delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Raised on the interrupt token; the work sees it at its next checkpoint.
    Raised,
    /// Async work already returned; the caller must settle the task directly.
    SettleNow,
    /// Sync work already returned and the task is completing on its own.
    TooLate,
}

pub(crate) struct TaskThread {
    interrupt: Arc<Interrupt>,
    kind: TaskKind,
}

impl TaskThread {
    pub(crate) fn spawn(task: TaskHandle) -> io::Result<Self> {
        let interrupt = Interrupt::new();
        let kind = task.kind();
        let token = interrupt.clone();
        let name = format!("task-{}", task.name());
        thread::Builder::new().name(name).spawn(move || {
            task.fire(TaskEvent::Running);
            task.run(token);
        })?;
        Ok(Self { interrupt, kind })
    }

    pub(crate) fn cancel(&self, task: &TaskHandle) -> Result<Delivery, TaskError> {
        self.deliver(task, InterruptKind::Cancel)
    }

    pub(crate) fn timeout(&self, task: &TaskHandle) -> Result<Delivery, TaskError> {
        self.deliver(task, InterruptKind::Timeout)
    }

    fn deliver(&self, task: &TaskHandle, kind: InterruptKind) -> Result<Delivery, TaskError> {
        let refuse = |reason| TaskError::ThreadState {
            task: task.describe(),
            reason,
        };
        if !self.interrupt.is_started() {
            return Err(refuse("execution thread has not started"));
        }
        if self.interrupt.has_returned() {
            return match self.kind {
                TaskKind::Async => Ok(Delivery::SettleNow),
                TaskKind::Sync => Ok(Delivery::TooLate),
            };
        }
        if self.interrupt.in_critical_section() {
            return Err(refuse("work is in a critical section"));
        }
        self.interrupt.raise(kind);
        Ok(Delivery::Raised)
    }
}
