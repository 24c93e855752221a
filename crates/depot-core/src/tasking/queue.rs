//! In-process task queue with a weight budget and a background dispatcher.
//!
//! All store access happens under one mutex. Hooks are collected while the
//! mutex is held and fired after it is released, so listeners may call back
//! into the queue.

use anyhow::{Context, Result};
use serde_json::Value;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::budget::WeightBudget;
use super::error::TaskError;
use super::hooks::TaskEvent;
use super::scheduler::{Immediate, Schedule, ScheduleKind};
use super::storage::TaskStores;
use super::task::{CompleteCallback, TaskHandle, TaskId, TaskState};
use crate::config::TaskingConfig;
use crate::control::lock;

/// Queue-wide limits and defaults.
#[derive(Debug, Clone)]
pub struct TaskQueueOptions {
    pub max_concurrency: usize,
    pub finished_lifetime: Duration,
    /// Applied to tasks that do not set their own.
    pub failure_threshold: Option<u32>,
    /// Applied to tasks that do not set their own.
    pub schedule_threshold: Option<Duration>,
    pub dispatch_interval: Duration,
}

impl From<&TaskingConfig> for TaskQueueOptions {
    fn from(cfg: &TaskingConfig) -> Self {
        Self {
            max_concurrency: cfg.max_concurrency,
            finished_lifetime: cfg.finished_lifetime(),
            failure_threshold: cfg.failure_threshold,
            schedule_threshold: cfg.schedule_threshold(),
            dispatch_interval: cfg.dispatch_interval(),
        }
    }
}

impl Default for TaskQueueOptions {
    fn default() -> Self {
        Self::from(&TaskingConfig::default())
    }
}

/// Criteria for `TaskQueue::find`; unset fields match anything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub id: Option<TaskId>,
    pub name: Option<String>,
    pub args: Option<Value>,
    pub state: Option<TaskState>,
}

impl TaskFilter {
    pub fn by_id(id: TaskId) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &TaskHandle) -> bool {
        self.id.map_or(true, |id| task.id() == id)
            && self.name.as_deref().map_or(true, |name| task.name() == name)
            && self.args.as_ref().map_or(true, |args| task.args() == *args)
            && self.state.map_or(true, |state| task.state() == state)
    }
}

pub(super) type Fired = Vec<(TaskHandle, TaskEvent)>;

pub(super) struct QueueState {
    pub(super) stores: TaskStores,
    /// Tasks with a pending cancel request, retried each tick until delivered.
    pub(super) canceled: Vec<TaskHandle>,
    pub(super) wake: bool,
    pub(super) exit: bool,
}

pub(super) struct Shared {
    state: Mutex<QueueState>,
    pub(super) signal: Condvar,
    pub(super) budget: WeightBudget,
    pub(super) options: TaskQueueOptions,
}

impl Shared {
    pub(super) fn lock(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    pub(super) fn wait<'a>(&self, state: MutexGuard<'a, QueueState>) -> MutexGuard<'a, QueueState> {
        self.signal
            .wait_timeout(state, self.options.dispatch_interval)
            .unwrap_or_else(PoisonError::into_inner)
            .0
    }

    pub(super) fn wake(&self, state: &mut QueueState) {
        state.wake = true;
        self.signal.notify_all();
    }

    pub(super) fn enqueue_locked(
        self: &Arc<Self>,
        state: &mut QueueState,
        task: &TaskHandle,
        unique: bool,
        fired: &mut Fired,
    ) -> Result<(), TaskError> {
        if state.stores.is_queued(task.id()) {
            return Err(TaskError::Unscheduled {
                task: task.describe(),
                reason: "task is already queued".to_string(),
            });
        }
        if task.weight() > self.budget.max_total() {
            return Err(TaskError::Unscheduled {
                task: task.describe(),
                reason: format!(
                    "weight {} exceeds max concurrency {}",
                    task.weight(),
                    self.budget.max_total()
                ),
            });
        }
        if unique {
            check_unique(&state.stores, task)?;
        }
        task.schedule()?;
        task.reset();
        task.apply_defaults(self.options.failure_threshold, self.options.schedule_threshold);

        let queue = Arc::downgrade(self);
        let callback: CompleteCallback = Arc::new(move |task: &TaskHandle| {
            let shared = queue
                .upgrade()
                .context("task queue shut down before the task completed")?;
            shared.complete(task);
            Ok(())
        });
        task.set_complete_callback(Some(callback));

        state.stores.complete.remove(&task.id());
        state.stores.waiting.insert(task.clone());
        fired.push((task.clone(), TaskEvent::Enqueue));
        tracing::debug!(task_id = %task.id(), name = task.name(), scheduled = ?task.scheduled_time(), "task enqueued");
        self.wake(state);
        Ok(())
    }

    /// Retire a task that reached a complete state, then try to schedule its next run.
    pub(super) fn complete(self: &Arc<Self>, task: &TaskHandle) {
        let mut fired = Vec::new();
        {
            let mut state = self.lock();
            if state.stores.running.remove(&task.id()).is_some() {
                self.budget.release(task.weight());
            }
            task.set_complete_callback(None);

            let outcome = task.state();
            fired.push((task.clone(), TaskEvent::Exit));
            if let Some(event) = outcome.completion_event() {
                fired.push((task.clone(), event));
            }
            fired.push((task.clone(), TaskEvent::Dequeue));
            state.stores.complete.insert(task.id(), task.clone());
            tracing::debug!(task_id = %task.id(), state = %outcome, "task complete");

            if outcome == TaskState::Canceled {
                tracing::debug!(task_id = %task.id(), "canceled task is not rescheduled");
            } else {
                match self.enqueue_locked(&mut state, task, false, &mut fired) {
                    Ok(()) => {}
                    Err(e) if e.is_unscheduled() => {
                        tracing::debug!(task_id = %task.id(), "{}", e);
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task.id(), "could not re-enqueue task: {}", e);
                    }
                }
            }
            self.wake(&mut state);
        }
        self.fire(fired);
    }

    /// Fire collected hooks, then admit tasks whose enqueue hooks have run so the
    /// dispatcher may start them.
    pub(super) fn fire(&self, fired: Fired) {
        let mut admitted = Vec::new();
        for (task, event) in fired {
            task.fire(event);
            if event == TaskEvent::Enqueue {
                admitted.push(task.id());
            }
        }
        if admitted.is_empty() {
            return;
        }
        let mut state = self.lock();
        for id in admitted {
            state.stores.waiting.admit(id);
        }
        self.wake(&mut state);
    }
}

fn check_unique(stores: &TaskStores, task: &TaskHandle) -> Result<(), TaskError> {
    let kind = task.schedule_kind();
    let name = task.name();
    let args = task.args();
    for other in stores.incomplete_tasks() {
        if other.id() == task.id() || other.name() != name || other.args() != args {
            continue;
        }
        let other_kind = other.schedule_kind();
        let conflict = match (kind, other_kind) {
            (ScheduleKind::Immediate, ScheduleKind::Immediate) => true,
            (ScheduleKind::At(a), ScheduleKind::At(b)) => a == b,
            (ScheduleKind::Interval, ScheduleKind::Interval) => true,
            _ => false,
        };
        if conflict {
            return Err(TaskError::NonUnique {
                task: task.describe(),
                schedule: format!("{:?}", kind),
                existing: other.describe(),
                existing_schedule: format!("{:?}", other_kind),
            });
        }
    }
    Ok(())
}

/// Task queue owning waiting, running, and complete tasks plus the dispatcher thread.
///
/// Dropping the queue stops and joins the dispatcher. Tasks already running
/// keep their threads and finish on their own.
pub struct TaskQueue {
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<()>>,
}

impl TaskQueue {
    pub fn new(options: TaskQueueOptions) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                stores: TaskStores::default(),
                canceled: Vec::new(),
                wake: false,
                exit: false,
            }),
            signal: Condvar::new(),
            budget: WeightBudget::new(options.max_concurrency),
            options,
        });
        let worker = shared.clone();
        let dispatcher = thread::Builder::new()
            .name("task-dispatcher".to_string())
            .spawn(move || super::dispatch::dispatch_loop(worker))
            .context("spawn task dispatcher")?;
        Ok(Self {
            shared,
            dispatcher: Some(dispatcher),
        })
    }

    pub fn from_config(cfg: &TaskingConfig) -> Result<Self> {
        Self::new(TaskQueueOptions::from(cfg))
    }

    pub fn options(&self) -> &TaskQueueOptions {
        &self.shared.options
    }

    /// Schedule `task` and admit it to the waiting store.
    ///
    /// With `unique`, fails if an incomplete task with the same work identity
    /// has a conflicting schedule (both immediate, both interval, or both at the
    /// same time).
    pub fn enqueue(&self, task: &TaskHandle, unique: bool) -> Result<(), TaskError> {
        let mut fired = Vec::new();
        let result = {
            let mut state = self.shared.lock();
            self.shared.enqueue_locked(&mut state, task, unique, &mut fired)
        };
        self.shared.fire(fired);
        result
    }

    /// Remove a waiting task. A running task is left alone to finish; either way
    /// it will not be scheduled again. Returns true if the task was removed.
    pub fn remove(&self, task: &TaskHandle) -> bool {
        task.set_scheduler(Arc::new(Immediate));
        let removed = {
            let mut state = self.shared.lock();
            if state.stores.running.contains_key(&task.id()) {
                tracing::debug!(task_id = %task.id(), "task is running; letting it finish");
                None
            } else {
                state.stores.waiting.remove(task.id())
            }
        };
        match removed {
            Some(task) => {
                task.set_complete_callback(None);
                task.fire(TaskEvent::Dequeue);
                true
            }
            None => false,
        }
    }

    /// Request cancellation. Delivered by the dispatcher on its next tick and
    /// retried while the task cannot be interrupted.
    pub fn cancel(&self, task: &TaskHandle) {
        let mut state = self.shared.lock();
        if !state.canceled.iter().any(|t| t.id() == task.id()) {
            state.canceled.push(task.clone());
        }
        self.shared.wake(&mut state);
    }

    /// Replace a task's scheduling strategy. A completed task is enqueued again
    /// under the new strategy.
    pub fn reschedule(&self, task: &TaskHandle, scheduler: Arc<dyn Schedule>) -> Result<(), TaskError> {
        let mut fired = Vec::new();
        let result = {
            let mut state = self.shared.lock();
            task.set_scheduler(scheduler);
            if state.stores.complete.contains_key(&task.id()) {
                task.clear_scheduled_time();
                self.shared.enqueue_locked(&mut state, task, false, &mut fired)
            } else {
                Ok(())
            }
        };
        self.shared.fire(fired);
        result
    }

    /// Forget a completed task before it is culled.
    pub fn drop_complete(&self, task: &TaskHandle) -> bool {
        self.shared.lock().stores.complete.remove(&task.id()).is_some()
    }

    pub fn find(&self, filter: &TaskFilter) -> Vec<TaskHandle> {
        let state = self.shared.lock();
        state
            .stores
            .all_tasks()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    /// Tasks with the same work identity (name and args) as `task`.
    pub fn exists(&self, task: &TaskHandle, include_finished: bool) -> Vec<TaskHandle> {
        let filter = TaskFilter {
            name: Some(task.name().to_string()),
            args: Some(task.args()),
            ..TaskFilter::default()
        };
        let mut found = self.find(&filter);
        if !include_finished {
            found.retain(|t| !t.state().is_complete());
        }
        found
    }

    pub fn waiting_tasks(&self) -> Vec<TaskHandle> {
        self.shared.lock().stores.waiting.tasks().cloned().collect()
    }

    pub fn running_tasks(&self) -> Vec<TaskHandle> {
        self.shared.lock().stores.running_tasks().cloned().collect()
    }

    pub fn incomplete_tasks(&self) -> Vec<TaskHandle> {
        self.shared.lock().stores.incomplete_tasks().cloned().collect()
    }

    pub fn complete_tasks(&self) -> Vec<TaskHandle> {
        self.shared.lock().stores.complete.values().cloned().collect()
    }

    pub fn all_tasks(&self) -> Vec<TaskHandle> {
        self.shared.lock().stores.all_tasks().cloned().collect()
    }

    /// Sum of the weights of running tasks.
    pub fn running_weight(&self) -> usize {
        self.shared.budget.in_use()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.exit = true;
            self.shared.signal.notify_all();
        }
        if let Some(handle) = self.dispatcher.take() {
            if handle.join().is_err() {
                tracing::error!("task dispatcher thread panicked");
            }
        }
    }
}
