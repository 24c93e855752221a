//! Units of work executed by tasks, and the context handed to them.
//!
//! Work never discovers its task through ambient state: `execute` receives a
//! `TaskContext` that reports progress, exposes interruption checkpoints, and
//! (for asynchronous tasks) lets a later caller settle the task.

use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use super::task::{Task, TaskId};

pub type WorkResult = Result<Value, WorkError>;

/// Outcome of work other than a normal return.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// The queue asked the task to stop; does not count as a failure.
    #[error("canceled")]
    Canceled,
    /// The task ran past its timeout; does not count as a failure.
    #[error("timed out")]
    TimedOut,
    /// The work finished and asks not to be scheduled again.
    #[error("stop requested: {0}")]
    Stop(String),
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// A unit of work the queue can run without knowing what it does.
///
/// `name` and `args` identify the work for uniqueness checks and snapshots;
/// a `WorkRegistry` rebuilds the item from them after a restart.
pub trait WorkItem: Send + Sync {
    fn name(&self) -> &str;

    fn args(&self) -> Value {
        Value::Null
    }

    fn execute(&self, ctx: &TaskContext) -> WorkResult;
}

type WorkFn = dyn Fn(&TaskContext) -> WorkResult + Send + Sync;

/// Work item backed by a closure.
pub struct FnWork {
    name: String,
    args: Value,
    f: Box<WorkFn>,
}

impl WorkItem for FnWork {
    fn name(&self) -> &str {
        &self.name
    }

    fn args(&self) -> Value {
        self.args.clone()
    }

    fn execute(&self, ctx: &TaskContext) -> WorkResult {
        (self.f)(ctx)
    }
}

impl fmt::Debug for FnWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnWork")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

/// Wrap a closure as a shareable work item.
pub fn work_fn<F>(name: impl Into<String>, args: Value, f: F) -> Arc<dyn WorkItem>
where
    F: Fn(&TaskContext) -> WorkResult + Send + Sync + 'static,
{
    Arc::new(FnWork {
        name: name.into(),
        args,
        f: Box::new(f),
    })
}

/// Kind of interruption delivered to running work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    Cancel,
    Timeout,
}

const NONE: u8 = 0;
const CANCEL: u8 = 1;
const TIMEOUT: u8 = 2;

/// Interruption state shared by a task's execution thread and the dispatcher.
#[derive(Debug, Default)]
pub(crate) struct Interrupt {
    pending: AtomicU8,
    critical: AtomicUsize,
    started: AtomicBool,
    returned: AtomicBool,
}

impl Interrupt {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_returned(&self) {
        self.returned.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// True once the work's `execute` has returned (async tasks may still be running).
    pub(crate) fn has_returned(&self) -> bool {
        self.returned.load(Ordering::SeqCst)
    }

    pub(crate) fn in_critical_section(&self) -> bool {
        self.critical.load(Ordering::SeqCst) > 0
    }

    /// Record an interrupt. A pending cancel is never downgraded to a timeout.
    pub(crate) fn raise(&self, kind: InterruptKind) {
        let value = match kind {
            InterruptKind::Cancel => CANCEL,
            InterruptKind::Timeout => TIMEOUT,
        };
        let _ = self
            .pending
            .compare_exchange(NONE, value, Ordering::SeqCst, Ordering::SeqCst);
        if kind == InterruptKind::Cancel {
            self.pending.store(CANCEL, Ordering::SeqCst);
        }
    }

    pub(crate) fn pending(&self) -> Option<InterruptKind> {
        match self.pending.load(Ordering::SeqCst) {
            CANCEL => Some(InterruptKind::Cancel),
            TIMEOUT => Some(InterruptKind::Timeout),
            _ => None,
        }
    }
}

/// Handle given to `WorkItem::execute`.
///
/// Cloneable and `Send`, so asynchronous work can hand it to whatever later
/// settles the task with `succeeded`/`failed`.
#[derive(Clone)]
pub struct TaskContext {
    task: Weak<Task>,
    task_id: TaskId,
    interrupt: Arc<Interrupt>,
    deadline: Option<Instant>,
}

impl TaskContext {
    pub(crate) fn new(
        task: &Arc<Task>,
        interrupt: Arc<Interrupt>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            task: Arc::downgrade(task),
            task_id: task.id(),
            interrupt,
            deadline: timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Return early with `Canceled`/`TimedOut` when an interrupt is pending or
    /// the deadline has passed. Inside `critical` sections this always succeeds.
    pub fn checkpoint(&self) -> Result<(), WorkError> {
        if self.interrupt.in_critical_section() {
            return Ok(());
        }
        match self.interrupt.pending() {
            Some(InterruptKind::Cancel) => return Err(WorkError::Canceled),
            Some(InterruptKind::Timeout) => return Err(WorkError::TimedOut),
            None => {}
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(WorkError::TimedOut);
            }
        }
        Ok(())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.pending().is_some()
    }

    /// Run `f` as a non-interruptible section. Cancel requests arriving meanwhile
    /// are refused and retried by the dispatcher.
    pub fn critical<R>(&self, f: impl FnOnce() -> R) -> R {
        struct Section<'a>(&'a AtomicUsize);
        impl Drop for Section<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.interrupt.critical.fetch_add(1, Ordering::SeqCst);
        let _section = Section(&self.interrupt.critical);
        f()
    }

    /// Sleep in small steps, returning early if interrupted.
    pub fn sleep(&self, duration: Duration) -> Result<(), WorkError> {
        let until = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep((until - now).min(Duration::from_millis(10)));
        }
    }

    pub fn set_progress(&self, progress: Value) {
        if let Some(task) = self.task.upgrade() {
            task.set_progress(progress);
        }
    }

    /// Settle an asynchronous task as finished.
    pub fn succeeded(&self, result: Value) {
        if let Some(task) = self.task.upgrade() {
            task.succeeded(result);
        }
    }

    /// Settle an asynchronous task as failed.
    pub fn failed(&self, message: impl fmt::Display) {
        if let Some(task) = self.task.upgrade() {
            task.failed(message, None);
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("pending", &self.interrupt.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_overrides_timeout() {
        let interrupt = Interrupt::new();
        interrupt.raise(InterruptKind::Timeout);
        assert_eq!(interrupt.pending(), Some(InterruptKind::Timeout));
        interrupt.raise(InterruptKind::Cancel);
        assert_eq!(interrupt.pending(), Some(InterruptKind::Cancel));
        interrupt.raise(InterruptKind::Timeout);
        assert_eq!(interrupt.pending(), Some(InterruptKind::Cancel));
    }

    #[test]
    fn work_fn_exposes_identity() {
        let work = work_fn("sync_repo", serde_json::json!(["repo-1"]), |_| Ok(Value::Null));
        assert_eq!(work.name(), "sync_repo");
        assert_eq!(work.args(), serde_json::json!(["repo-1"]));
    }
}
