//! Task: a schedulable unit of work and its state machine.
//!
//! A task moves `Waiting -> Running -> {Finished, Error, TimedOut, Canceled}`
//! and only leaves a complete state through `reset`. The owning queue installs
//! a completion callback that is invoked, outside the task's lock, every time
//! the task reaches a complete state.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;

use super::error::TaskError;
use super::hooks::{notify, TaskEvent, TaskListener};
use super::scheduler::{Immediate, Schedule, ScheduleKind};
use super::work::{Interrupt, TaskContext, WorkError, WorkItem};
use crate::control::{lock, panic_message};

pub type TaskHandle = Arc<Task>;

pub(crate) type CompleteCallback = Arc<dyn Fn(&TaskHandle) -> anyhow::Result<()> + Send + Sync>;

/// Time-ordered unique task id (UUID v7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Running,
    Suspended,
    Finished,
    Error,
    TimedOut,
    Canceled,
}

impl TaskState {
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Error | TaskState::TimedOut | TaskState::Canceled
        )
    }

    /// Hook event fired when a task reaches this state, if it is complete.
    pub(crate) fn completion_event(self) -> Option<TaskEvent> {
        match self {
            TaskState::Finished => Some(TaskEvent::Finished),
            TaskState::Error => Some(TaskEvent::Error),
            TaskState::TimedOut => Some(TaskEvent::TimedOut),
            TaskState::Canceled => Some(TaskEvent::Canceled),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Waiting => "waiting",
            TaskState::Running => "running",
            TaskState::Suspended => "suspended",
            TaskState::Finished => "finished",
            TaskState::Error => "error",
            TaskState::TimedOut => "timed_out",
            TaskState::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Synchronous tasks finish when their work returns. Asynchronous tasks stay
/// `Running` after the work returns until `succeeded`/`failed` is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Sync,
    Async,
}

pub(crate) struct TaskInner {
    pub(crate) scheduler: Arc<dyn Schedule>,
    pub(crate) failure_threshold: Option<u32>,
    pub(crate) schedule_threshold: Option<Duration>,
    pub(crate) state: TaskState,
    pub(crate) scheduled_time: Option<DateTime<Utc>>,
    pub(crate) start_time: Option<DateTime<Utc>>,
    pub(crate) finish_time: Option<DateTime<Utc>>,
    pub(crate) progress: Value,
    pub(crate) result: Option<Value>,
    pub(crate) exception: Option<String>,
    pub(crate) traceback: Option<String>,
    pub(crate) consecutive_failures: u32,
    pub(crate) cancel_attempts: u32,
    stop_requested: bool,
    on_complete: Option<CompleteCallback>,
    completions: u64,
    last_outcome: Option<TaskState>,
}

pub struct Task {
    id: TaskId,
    work: Arc<dyn WorkItem>,
    kind: TaskKind,
    weight: usize,
    timeout: Option<Duration>,
    pub(crate) inner: Mutex<TaskInner>,
    settled: Condvar,
    hooks: RwLock<HashMap<TaskEvent, Vec<Arc<dyn TaskListener>>>>,
}

pub struct TaskBuilder {
    id: Option<TaskId>,
    work: Arc<dyn WorkItem>,
    kind: TaskKind,
    weight: i64,
    timeout: Option<Duration>,
    scheduler: Arc<dyn Schedule>,
    failure_threshold: Option<u32>,
    schedule_threshold: Option<Duration>,
}

impl TaskBuilder {
    pub(crate) fn id(mut self, id: TaskId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    /// Concurrency cost. Values `<= 0` are corrected to 1.
    pub fn weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn schedule(mut self, scheduler: impl Schedule + 'static) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    pub fn schedule_threshold(mut self, threshold: Duration) -> Self {
        self.schedule_threshold = Some(threshold);
        self
    }

    pub fn build(self) -> TaskHandle {
        let id = self.id.unwrap_or_default();
        let weight = if self.weight <= 0 {
            tracing::error!(
                task_id = %id,
                weight = self.weight,
                "task weight must be positive; using 1"
            );
            1
        } else {
            usize::try_from(self.weight).unwrap_or(usize::MAX)
        };
        Arc::new(Task {
            id,
            work: self.work,
            kind: self.kind,
            weight,
            timeout: self.timeout,
            inner: Mutex::new(TaskInner {
                scheduler: self.scheduler,
                failure_threshold: self.failure_threshold,
                schedule_threshold: self.schedule_threshold,
                state: TaskState::Waiting,
                scheduled_time: None,
                start_time: None,
                finish_time: None,
                progress: Value::Null,
                result: None,
                exception: None,
                traceback: None,
                consecutive_failures: 0,
                cancel_attempts: 0,
                stop_requested: false,
                on_complete: None,
                completions: 0,
                last_outcome: None,
            }),
            settled: Condvar::new(),
            hooks: RwLock::new(HashMap::new()),
        })
    }
}

impl Task {
    /// Start building a task for `work`, scheduled to run once immediately by default.
    pub fn builder(work: Arc<dyn WorkItem>) -> TaskBuilder {
        TaskBuilder {
            id: None,
            work,
            kind: TaskKind::Sync,
            weight: 1,
            timeout: None,
            scheduler: Arc::new(Immediate),
            failure_threshold: None,
            schedule_threshold: None,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn work(&self) -> &Arc<dyn WorkItem> {
        &self.work
    }

    pub fn name(&self) -> &str {
        self.work.name()
    }

    pub fn args(&self) -> Value {
        self.work.args()
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn weight(&self) -> usize {
        self.weight
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, TaskInner> {
        lock(&self.inner)
    }

    pub fn state(&self) -> TaskState {
        self.lock_inner().state
    }

    pub fn scheduled_time(&self) -> Option<DateTime<Utc>> {
        self.lock_inner().scheduled_time
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.lock_inner().start_time
    }

    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.lock_inner().finish_time
    }

    pub fn progress(&self) -> Value {
        self.lock_inner().progress.clone()
    }

    pub fn result(&self) -> Option<Value> {
        self.lock_inner().result.clone()
    }

    pub fn exception(&self) -> Option<String> {
        self.lock_inner().exception.clone()
    }

    pub fn traceback(&self) -> Option<String> {
        self.lock_inner().traceback.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock_inner().consecutive_failures
    }

    pub fn cancel_attempts(&self) -> u32 {
        self.lock_inner().cancel_attempts
    }

    pub fn failure_threshold(&self) -> Option<u32> {
        self.lock_inner().failure_threshold
    }

    pub fn schedule_threshold(&self) -> Option<Duration> {
        self.lock_inner().schedule_threshold
    }

    pub fn scheduler(&self) -> Arc<dyn Schedule> {
        self.lock_inner().scheduler.clone()
    }

    pub fn schedule_kind(&self) -> ScheduleKind {
        self.lock_inner().scheduler.kind()
    }

    /// Replace the scheduling strategy. Clears a stop requested by earlier work.
    pub fn set_scheduler(&self, scheduler: Arc<dyn Schedule>) {
        let mut inner = self.lock_inner();
        inner.scheduler = scheduler;
        inner.stop_requested = false;
    }

    /// Forget the previous scheduled time so the next `schedule` starts fresh.
    pub(crate) fn clear_scheduled_time(&self) {
        self.lock_inner().scheduled_time = None;
    }

    /// Human-readable identity used in log and error messages.
    pub fn describe(&self) -> String {
        format!("{} {}({})", self.id, self.work.name(), self.work.args())
    }

    pub fn add_listener(&self, event: TaskEvent, listener: impl TaskListener + 'static) {
        self.add_listener_arc(event, Arc::new(listener));
    }

    pub fn add_listener_arc(&self, event: TaskEvent, listener: Arc<dyn TaskListener>) {
        let mut hooks = self.hooks.write().unwrap_or_else(PoisonError::into_inner);
        hooks.entry(event).or_default().push(listener);
    }

    /// Events that currently have at least one listener.
    pub fn hooked_events(&self) -> Vec<TaskEvent> {
        let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
        hooks
            .iter()
            .filter(|(_, listeners)| !listeners.is_empty())
            .map(|(event, _)| *event)
            .collect()
    }

    /// Invoke every listener registered for `event`, each failure logged on its own.
    pub(crate) fn fire(self: &Arc<Self>, event: TaskEvent) {
        let listeners: Vec<Arc<dyn TaskListener>> = {
            let hooks = self.hooks.read().unwrap_or_else(PoisonError::into_inner);
            hooks.get(&event).cloned().unwrap_or_default()
        };
        for listener in listeners {
            notify(listener.as_ref(), self, event);
        }
    }

    /// Ask the scheduler for the next run time.
    ///
    /// Fails when the failure threshold has been reached, when the work asked to
    /// stop, or when the strategy has no further runs.
    pub fn schedule(&self) -> Result<(), TaskError> {
        let mut inner = self.lock_inner();
        if inner.stop_requested {
            return Err(TaskError::Unscheduled {
                task: self.describe(),
                reason: "work requested stop".to_string(),
            });
        }
        if let Some(threshold) = inner.failure_threshold {
            if inner.consecutive_failures >= threshold {
                return Err(TaskError::Unscheduled {
                    task: self.describe(),
                    reason: format!(
                        "{} consecutive failures reached threshold {}",
                        inner.consecutive_failures, threshold
                    ),
                });
            }
        }
        let (missed, next) = inner.scheduler.schedule(inner.scheduled_time);
        let Some(next) = next else {
            return Err(TaskError::Unscheduled {
                task: self.describe(),
                reason: "no further runs scheduled".to_string(),
            });
        };
        if missed > 0 {
            tracing::warn!(task_id = %self.id, missed, "task missed scheduled runs");
        }
        inner.scheduled_time = Some(next);
        Ok(())
    }

    /// Return to `Waiting`, clearing everything recorded by the last run.
    /// `consecutive_failures` survives.
    pub fn reset(&self) {
        let mut inner = self.lock_inner();
        inner.state = TaskState::Waiting;
        inner.start_time = None;
        inner.finish_time = None;
        inner.progress = Value::Null;
        inner.result = None;
        inner.exception = None;
        inner.traceback = None;
        inner.cancel_attempts = 0;
    }

    pub(crate) fn apply_defaults(&self, failure_threshold: Option<u32>, schedule_threshold: Option<Duration>) {
        let mut inner = self.lock_inner();
        if inner.failure_threshold.is_none() {
            inner.failure_threshold = failure_threshold;
        }
        if inner.schedule_threshold.is_none() {
            inner.schedule_threshold = schedule_threshold;
        }
    }

    pub(crate) fn set_complete_callback(&self, callback: Option<CompleteCallback>) {
        self.lock_inner().on_complete = callback;
    }

    pub(crate) fn note_cancel_attempt(&self) -> u32 {
        let mut inner = self.lock_inner();
        inner.cancel_attempts += 1;
        inner.cancel_attempts
    }

    pub fn set_progress(&self, progress: Value) {
        self.lock_inner().progress = progress;
    }

    /// Execute the work on the calling thread. Never panics or returns an error:
    /// every outcome is recorded on the task.
    pub(crate) fn run(self: &Arc<Self>, interrupt: Arc<Interrupt>) {
        {
            let mut inner = self.lock_inner();
            if inner.state != TaskState::Waiting {
                tracing::error!(task_id = %self.id, state = %inner.state, "task cannot run from this state");
                return;
            }
            let now = Utc::now();
            inner.state = TaskState::Running;
            inner.start_time = Some(now);
            if let (Some(threshold), Some(scheduled)) = (inner.schedule_threshold, inner.scheduled_time) {
                let threshold = ChronoDuration::from_std(threshold).unwrap_or(ChronoDuration::zero());
                if now > scheduled + threshold {
                    tracing::warn!(
                        task_id = %self.id,
                        scheduled = %scheduled,
                        started = %now,
                        "task started later than its schedule threshold"
                    );
                }
            }
        }
        interrupt.mark_started();
        tracing::debug!(task_id = %self.id, name = self.work.name(), "task running");

        let ctx = TaskContext::new(self, interrupt.clone(), self.timeout);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.work.execute(&ctx)));
        interrupt.mark_returned();

        match outcome {
            Ok(Ok(value)) => match self.kind {
                TaskKind::Sync => {
                    self.succeeded(value);
                }
                TaskKind::Async => {
                    tracing::debug!(task_id = %self.id, "async task returned; awaiting settlement");
                }
            },
            Ok(Err(WorkError::Canceled)) => {
                self.canceled();
            }
            Ok(Err(WorkError::TimedOut)) => {
                self.timed_out();
            }
            Ok(Err(WorkError::Stop(reason))) => {
                tracing::info!(task_id = %self.id, %reason, "work requested stop");
                self.lock_inner().stop_requested = true;
                self.succeeded(Value::Null);
            }
            Ok(Err(WorkError::Failed(e))) => {
                self.failed(&e, Some(format!("{:?}", e)));
            }
            Err(panic) => {
                let message = format!("work panicked: {}", panic_message(panic.as_ref()));
                self.failed(message, None);
            }
        }
    }

    /// Mark the task finished with `result`. Resets the failure counter.
    /// Returns false if the task was not running.
    pub fn succeeded(self: &Arc<Self>, result: Value) -> bool {
        self.settle(TaskState::Finished, |inner| {
            inner.result = Some(result);
            inner.consecutive_failures = 0;
        })
    }

    /// Mark the task failed, recording the message and optional error chain.
    pub fn failed(self: &Arc<Self>, message: impl fmt::Display, traceback: Option<String>) -> bool {
        let message = message.to_string();
        let settled = self.settle(TaskState::Error, |inner| {
            inner.exception = Some(message.clone());
            inner.traceback = traceback;
            inner.consecutive_failures += 1;
        });
        if settled {
            tracing::warn!(task_id = %self.id, error = %message, "task failed");
        }
        settled
    }

    pub(crate) fn canceled(self: &Arc<Self>) -> bool {
        self.settle(TaskState::Canceled, |_| {})
    }

    pub(crate) fn timed_out(self: &Arc<Self>) -> bool {
        self.settle(TaskState::TimedOut, |_| {})
    }

    /// Cancel a task that never started.
    pub(crate) fn cancel_waiting(self: &Arc<Self>) -> bool {
        self.transition(TaskState::Waiting, TaskState::Canceled, |_| {})
    }

    /// Record a task whose execution thread could not be started.
    pub(crate) fn abort_start(self: &Arc<Self>, message: impl fmt::Display) -> bool {
        let message = message.to_string();
        self.transition(TaskState::Waiting, TaskState::Error, |inner| {
            inner.start_time = Some(Utc::now());
            inner.exception = Some(message);
            inner.consecutive_failures += 1;
        })
    }

    fn settle(self: &Arc<Self>, to: TaskState, apply: impl FnOnce(&mut TaskInner)) -> bool {
        self.transition(TaskState::Running, to, apply)
    }

    fn transition(
        self: &Arc<Self>,
        from: TaskState,
        to: TaskState,
        apply: impl FnOnce(&mut TaskInner),
    ) -> bool {
        let callback = {
            let mut inner = self.lock_inner();
            if inner.state != from {
                tracing::debug!(task_id = %self.id, state = %inner.state, target = %to, "ignoring state change");
                return false;
            }
            inner.state = to;
            apply(&mut inner);
            inner.finish_time = Some(Utc::now());
            inner.last_outcome = Some(to);
            inner.on_complete.clone()
        };
        self.complete(callback);
        true
    }

    fn complete(self: &Arc<Self>, callback: Option<CompleteCallback>) {
        if let Some(callback) = callback {
            match catch_unwind(AssertUnwindSafe(|| callback(self))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(task_id = %self.id, "task completion callback failed: {:#}", e);
                }
                Err(panic) => {
                    tracing::error!(
                        task_id = %self.id,
                        "task completion callback panicked: {}",
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
        let mut inner = self.lock_inner();
        inner.completions += 1;
        self.settled.notify_all();
    }

    /// Block until the task has completed at least once, returning the outcome
    /// of its latest run, or `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Option<TaskState> {
        if self.wait_for_completions(1, timeout) {
            self.lock_inner().last_outcome
        } else {
            None
        }
    }

    /// Block until the task has completed `count` runs in total.
    pub fn wait_for_completions(&self, count: u64, timeout: Duration) -> bool {
        let inner = self.lock_inner();
        let (inner, _) = self
            .settled
            .wait_timeout_while(inner, timeout, |inner| inner.completions < count)
            .unwrap_or_else(PoisonError::into_inner);
        inner.completions >= count
    }

    /// Outcome of the most recent run, kept across re-enqueue.
    pub fn last_outcome(&self) -> Option<TaskState> {
        self.lock_inner().last_outcome
    }

    pub(crate) fn restore_fields(&self, apply: impl FnOnce(&mut TaskInner)) {
        apply(&mut self.lock_inner());
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Task {}

impl Hash for Task {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.work.name())
            .field("kind", &self.kind)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::scheduler::{At, Interval};
    use crate::tasking::work::work_fn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> Arc<dyn WorkItem> {
        work_fn("noop", Value::Null, |_| Ok(Value::from(42)))
    }

    fn failing() -> Arc<dyn WorkItem> {
        work_fn("boom", Value::Null, |_| Err(anyhow::anyhow!("boom").into()))
    }

    fn run_once(task: &TaskHandle) {
        task.schedule().unwrap();
        task.reset();
        task.run(Interrupt::new());
    }

    #[test]
    fn successful_run_finishes() {
        let task = Task::builder(noop()).build();
        assert_eq!(task.state(), TaskState::Waiting);
        run_once(&task);
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.result(), Some(Value::from(42)));
        assert!(task.start_time().is_some());
        assert!(task.finish_time().is_some());
    }

    #[test]
    fn failure_records_error_and_counts() {
        let task = Task::builder(failing()).schedule(Interval::new(Duration::from_secs(60))).build();
        run_once(&task);
        assert_eq!(task.state(), TaskState::Error);
        assert_eq!(task.exception().as_deref(), Some("boom"));
        assert!(task.traceback().is_some());
        assert_eq!(task.consecutive_failures(), 1);
        task.reset();
        assert_eq!(task.exception(), None);
        assert_eq!(task.consecutive_failures(), 1);
    }

    #[test]
    fn failure_threshold_refuses_schedule() {
        let task = Task::builder(failing())
            .schedule(Interval::new(Duration::from_secs(60)))
            .failure_threshold(2)
            .build();
        run_once(&task);
        run_once(&task);
        assert_eq!(task.consecutive_failures(), 2);
        let err = task.schedule().unwrap_err();
        assert!(err.is_unscheduled());
    }

    #[test]
    fn control_outcomes_do_not_count_as_failures() {
        let canceled = Task::builder(work_fn("c", Value::Null, |_| Err(WorkError::Canceled))).build();
        run_once(&canceled);
        assert_eq!(canceled.state(), TaskState::Canceled);
        assert_eq!(canceled.consecutive_failures(), 0);

        let timed_out = Task::builder(work_fn("t", Value::Null, |_| Err(WorkError::TimedOut))).build();
        run_once(&timed_out);
        assert_eq!(timed_out.state(), TaskState::TimedOut);
        assert_eq!(timed_out.consecutive_failures(), 0);
    }

    #[test]
    fn panic_is_a_failure() {
        let task = Task::builder(work_fn("p", Value::Null, |_| panic!("kaboom"))).build();
        run_once(&task);
        assert_eq!(task.state(), TaskState::Error);
        assert!(task.exception().unwrap().contains("kaboom"));
    }

    #[test]
    fn stop_request_prevents_rescheduling() {
        let task = Task::builder(work_fn("s", Value::Null, |_| Err(WorkError::Stop("done".into()))))
            .schedule(Interval::new(Duration::from_secs(60)))
            .build();
        run_once(&task);
        assert_eq!(task.state(), TaskState::Finished);
        assert!(task.schedule().unwrap_err().is_unscheduled());
    }

    #[test]
    fn complete_state_is_terminal_until_reset() {
        let task = Task::builder(noop()).build();
        run_once(&task);
        assert!(!task.failed("late", None));
        assert_eq!(task.state(), TaskState::Finished);
        task.reset();
        assert_eq!(task.state(), TaskState::Waiting);
        assert_eq!(task.result(), None);
    }

    #[test]
    fn async_task_waits_for_settlement() {
        let held: Arc<Mutex<Option<TaskContext>>> = Arc::new(Mutex::new(None));
        let slot = held.clone();
        let work = work_fn("async", Value::Null, move |ctx| {
            *slot.lock().unwrap() = Some(ctx.clone());
            Ok(Value::Null)
        });
        let task = Task::builder(work).kind(TaskKind::Async).build();
        run_once(&task);
        assert_eq!(task.state(), TaskState::Running);
        let ctx = held.lock().unwrap().take().unwrap();
        ctx.succeeded(Value::from("done"));
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.result(), Some(Value::from("done")));
    }

    #[test]
    fn completion_callback_failure_is_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let task = Task::builder(noop()).build();
        let callback: CompleteCallback = Arc::new(move |_t: &TaskHandle| -> anyhow::Result<()> {
            seen.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("callback broke")
        });
        task.set_complete_callback(Some(callback));
        run_once(&task);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.state(), TaskState::Finished);
        assert_eq!(task.wait(Duration::from_millis(10)), Some(TaskState::Finished));
    }

    #[test]
    fn non_positive_weight_is_corrected() {
        assert_eq!(Task::builder(noop()).weight(0).build().weight(), 1);
        assert_eq!(Task::builder(noop()).weight(-3).build().weight(), 1);
        assert_eq!(Task::builder(noop()).weight(3).build().weight(), 3);
    }

    #[test]
    fn equality_is_by_identity() {
        let when = Utc::now() + ChronoDuration::hours(1);
        let a = Task::builder(noop()).schedule(At::new(when)).build();
        let b = Task::builder(noop()).schedule(At::new(when)).build();
        a.schedule().unwrap();
        b.schedule().unwrap();
        assert_eq!(a.scheduled_time(), b.scheduled_time());
        assert_ne!(*a, *b);
        assert_eq!(*a, *a.clone());
    }

    #[test]
    fn listener_errors_do_not_stop_other_listeners() {
        let task = Task::builder(noop()).build();
        let hits = Arc::new(AtomicUsize::new(0));
        task.add_listener(TaskEvent::Enqueue, |_: &TaskHandle, _: TaskEvent| -> anyhow::Result<()> {
            anyhow::bail!("first")
        });
        let counter = hits.clone();
        task.add_listener(TaskEvent::Enqueue, move |_: &TaskHandle, _: TaskEvent| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        task.fire(TaskEvent::Enqueue);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
