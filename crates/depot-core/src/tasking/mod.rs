//! Task dispatch: tasks, scheduling strategies, and the task queue.

mod budget;
mod dispatch;
mod error;
mod hooks;
mod queue;
mod scheduler;
mod snapshot;
mod storage;
mod task;
mod thread;
mod work;

pub use budget::WeightBudget;
pub use error::TaskError;
pub use hooks::{TaskEvent, TaskListener};
pub use queue::{TaskFilter, TaskQueue, TaskQueueOptions};
pub use scheduler::{At, Immediate, Interval, Schedule, ScheduleKind};
pub use snapshot::{SnapshotStore, TaskSnapshot, WorkRegistry};
pub use task::{Task, TaskBuilder, TaskHandle, TaskId, TaskKind, TaskState};
pub use work::{work_fn, FnWork, TaskContext, WorkError, WorkItem, WorkResult};
