//! Waiting, running, and complete task stores owned by a `TaskQueue`.
//!
//! None of these types lock; the queue guards them all with its own mutex.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::task::{TaskHandle, TaskId};
use super::thread::TaskThread;

pub(crate) struct WaitingEntry {
    pub(crate) key: Option<DateTime<Utc>>,
    /// False until the task's enqueue hooks have fired; the dispatcher will not
    /// start a task (or anything behind it) before then.
    pub(crate) admitted: bool,
    pub(crate) task: TaskHandle,
}

/// Waiting tasks ordered by scheduled time (unscheduled first), FIFO among equal times.
#[derive(Default)]
pub(crate) struct WaitingTasks {
    entries: Vec<WaitingEntry>,
}

impl WaitingTasks {
    pub(crate) fn insert(&mut self, task: TaskHandle) {
        let key = task.scheduled_time();
        let at = self.entries.partition_point(|e| e.key <= key);
        self.entries.insert(
            at,
            WaitingEntry {
                key,
                admitted: false,
                task,
            },
        );
    }

    pub(crate) fn admit(&mut self, id: TaskId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.task.id() == id) {
            entry.admitted = true;
        }
    }

    pub(crate) fn peek(&self) -> Option<&WaitingEntry> {
        self.entries.first()
    }

    pub(crate) fn pop_front(&mut self) -> Option<TaskHandle> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0).task)
        }
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> Option<TaskHandle> {
        let index = self.entries.iter().position(|e| e.task.id() == id)?;
        Some(self.entries.remove(index).task)
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.entries.iter().any(|e| e.task.id() == id)
    }

    pub(crate) fn tasks(&self) -> impl Iterator<Item = &TaskHandle> {
        self.entries.iter().map(|e| &e.task)
    }
}

pub(crate) struct RunningTask {
    pub(crate) task: TaskHandle,
    /// `None` when the execution thread failed to spawn.
    pub(crate) thread: Option<TaskThread>,
}

#[derive(Default)]
pub(crate) struct TaskStores {
    pub(crate) waiting: WaitingTasks,
    pub(crate) running: HashMap<TaskId, RunningTask>,
    pub(crate) complete: HashMap<TaskId, TaskHandle>,
}

impl TaskStores {
    pub(crate) fn running_tasks(&self) -> impl Iterator<Item = &TaskHandle> {
        self.running.values().map(|r| &r.task)
    }

    pub(crate) fn incomplete_tasks(&self) -> impl Iterator<Item = &TaskHandle> {
        self.waiting.tasks().chain(self.running_tasks())
    }

    pub(crate) fn all_tasks(&self) -> impl Iterator<Item = &TaskHandle> {
        self.incomplete_tasks()
            .chain(self.complete.values().filter(|t| !self.waiting.contains(t.id())))
    }

    pub(crate) fn is_queued(&self, id: TaskId) -> bool {
        self.waiting.contains(id) || self.running.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::scheduler::At;
    use crate::tasking::task::Task;
    use crate::tasking::work::work_fn;
    use chrono::Duration as ChronoDuration;
    use serde_json::Value;

    fn task_at(offset_secs: Option<i64>) -> TaskHandle {
        let mut builder = Task::builder(work_fn("noop", Value::Null, |_| Ok(Value::Null)));
        if let Some(secs) = offset_secs {
            builder = builder.schedule(At::new(Utc::now() + ChronoDuration::seconds(secs)));
        }
        let task = builder.build();
        if offset_secs.is_some() {
            task.schedule().unwrap();
        }
        task
    }

    #[test]
    fn waiting_orders_by_time_and_keeps_fifo() {
        let mut waiting = WaitingTasks::default();
        let late = task_at(Some(600));
        let early = task_at(Some(60));
        let unscheduled = task_at(None);
        let same_as_early = Task::builder(work_fn("noop", Value::Null, |_| Ok(Value::Null)))
            .schedule(At::new(early.scheduled_time().unwrap()))
            .build();
        same_as_early.schedule().unwrap();

        waiting.insert(late.clone());
        waiting.insert(early.clone());
        waiting.insert(same_as_early.clone());
        waiting.insert(unscheduled.clone());

        let order: Vec<TaskId> = waiting.tasks().map(|t| t.id()).collect();
        assert_eq!(
            order,
            vec![unscheduled.id(), early.id(), same_as_early.id(), late.id()]
        );
        assert!(waiting.remove(early.id()).is_some());
        assert!(!waiting.contains(early.id()));
        assert_eq!(waiting.pop_front().map(|t| t.id()), Some(unscheduled.id()));
        let head = waiting.peek().unwrap();
        assert_eq!(head.task.id(), same_as_early.id());
        assert!(!head.admitted);
        waiting.admit(same_as_early.id());
        assert!(waiting.peek().unwrap().admitted);
    }
}
