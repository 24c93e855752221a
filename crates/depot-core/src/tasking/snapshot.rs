//! Task snapshots for recovery after a restart.
//!
//! A snapshot holds a task's identity, its work identity (name and args), and
//! the fields recorded by its runs. Work is rebuilt from a `WorkRegistry`
//! rather than serialized, and a restored task always runs immediately.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::hooks::{TaskEvent, TaskListener};
use super::scheduler::Immediate;
use super::task::{Task, TaskHandle, TaskId, TaskKind, TaskState};
use super::work::WorkItem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub kind: TaskKind,
    pub weight: usize,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub schedule_threshold: Option<Duration>,
    pub state: TaskState,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub progress: Value,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub cancel_attempts: u32,
}

type WorkFactory = dyn Fn(&Value) -> Result<Arc<dyn WorkItem>> + Send + Sync;

/// Maps work names to constructors so restored tasks get real work items back.
#[derive(Default, Clone)]
pub struct WorkRegistry {
    factories: HashMap<String, Arc<WorkFactory>>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> Result<Arc<dyn WorkItem>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn build(&self, name: &str, args: &Value) -> Result<Arc<dyn WorkItem>> {
        let Some(factory) = self.factories.get(name) else {
            bail!("no work registered under name {:?}", name);
        };
        let work = factory(args).with_context(|| format!("rebuild work {:?}", name))?;
        if work.name() != name {
            bail!("work registered as {:?} reports name {:?}", name, work.name());
        }
        Ok(work)
    }
}

impl Task {
    pub fn snapshot(&self) -> TaskSnapshot {
        let inner = self.lock_inner();
        TaskSnapshot {
            id: self.id(),
            name: self.name().to_string(),
            args: self.args(),
            kind: self.kind(),
            weight: self.weight(),
            timeout: self.timeout(),
            failure_threshold: inner.failure_threshold,
            schedule_threshold: inner.schedule_threshold,
            state: inner.state,
            scheduled_time: inner.scheduled_time,
            start_time: inner.start_time,
            finish_time: inner.finish_time,
            progress: inner.progress.clone(),
            result: inner.result.clone(),
            exception: inner.exception.clone(),
            traceback: inner.traceback.clone(),
            consecutive_failures: inner.consecutive_failures,
            cancel_attempts: inner.cancel_attempts,
        }
    }

    /// Rebuild a task from a snapshot. Whatever its former schedule, the task is
    /// restored with the immediate scheduler and a cleared scheduled time.
    pub fn from_snapshot(snapshot: TaskSnapshot, registry: &WorkRegistry) -> Result<TaskHandle> {
        let work = registry.build(&snapshot.name, &snapshot.args)?;
        let mut builder = Task::builder(work)
            .id(snapshot.id)
            .kind(snapshot.kind)
            .weight(i64::try_from(snapshot.weight).unwrap_or(i64::MAX))
            .timeout_opt(snapshot.timeout)
            .schedule(Immediate);
        if let Some(threshold) = snapshot.failure_threshold {
            builder = builder.failure_threshold(threshold);
        }
        if let Some(threshold) = snapshot.schedule_threshold {
            builder = builder.schedule_threshold(threshold);
        }
        let task = builder.build();
        task.restore_fields(|inner| {
            inner.start_time = snapshot.start_time;
            inner.finish_time = snapshot.finish_time;
            inner.progress = snapshot.progress;
            inner.result = snapshot.result;
            inner.exception = snapshot.exception;
            inner.traceback = snapshot.traceback;
            inner.consecutive_failures = snapshot.consecutive_failures;
            inner.cancel_attempts = snapshot.cancel_attempts;
        });
        Ok(task)
    }
}

/// Directory of `<task id>.json` snapshot files.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Default directory: `~/.local/state/depot/tasks`.
    pub fn default_dir() -> Result<PathBuf> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("depot")?;
        Ok(xdg_dirs.get_state_home().join("depot").join("tasks"))
    }

    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("create dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Write the snapshot to a temp file, then rename over the previous one.
    pub fn save(&self, snapshot: &TaskSnapshot) -> Result<()> {
        let path = self.path_for(snapshot.id);
        let tmp = path.with_extension("json.part");
        let json = serde_json::to_vec_pretty(snapshot).context("serialize task snapshot")?;
        std::fs::write(&tmp, json).with_context(|| format!("write task snapshot: {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }

    pub fn remove(&self, id: TaskId) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove task snapshot: {}", path.display())),
        }
    }

    /// Load every readable snapshot. Unreadable files are logged and skipped.
    pub fn load_all(&self) -> Result<Vec<TaskSnapshot>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("read dir: {}", self.dir.display()))?;
        let mut snapshots = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read(&path)
                .with_context(|| format!("read task snapshot: {}", path.display()))
                .and_then(|bytes| {
                    serde_json::from_slice::<TaskSnapshot>(&bytes)
                        .with_context(|| format!("parse task snapshot: {}", path.display()))
                });
            match parsed {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => tracing::error!("skipping task snapshot: {:#}", e),
            }
        }
        snapshots.sort_by_key(|s| s.id);
        Ok(snapshots)
    }

    /// Rebuild tasks for every stored snapshot that is not complete.
    /// Snapshots whose work cannot be rebuilt are logged and left on disk.
    pub fn recover(&self, registry: &WorkRegistry) -> Result<Vec<TaskHandle>> {
        let mut tasks = Vec::new();
        for snapshot in self.load_all()? {
            if snapshot.state.is_complete() {
                continue;
            }
            let id = snapshot.id;
            match Task::from_snapshot(snapshot, registry) {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::error!(task_id = %id, "cannot recover task: {:#}", e),
            }
        }
        Ok(tasks)
    }

    /// Listener keeping the store in sync with a task: saved on enqueue, deleted
    /// once the task exits without being scheduled again.
    pub fn listener(&self) -> Arc<dyn TaskListener> {
        Arc::new(SnapshotListener {
            store: self.clone(),
        })
    }

    /// Register the store's listener for the events it needs.
    pub fn track(&self, task: &TaskHandle) {
        let listener = self.listener();
        task.add_listener_arc(TaskEvent::Enqueue, listener.clone());
        task.add_listener_arc(TaskEvent::Exit, listener);
    }
}

struct SnapshotListener {
    store: SnapshotStore,
}

impl TaskListener for SnapshotListener {
    fn on_event(&self, task: &TaskHandle, event: TaskEvent) -> Result<()> {
        match event {
            TaskEvent::Enqueue => self.store.save(&task.snapshot()),
            TaskEvent::Exit if task.state().is_complete() => self.store.remove(task.id()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasking::scheduler::Interval;
    use crate::tasking::work::{work_fn, WorkError};

    fn registry() -> WorkRegistry {
        let mut registry = WorkRegistry::new();
        registry.register("sync_repo", |args: &Value| {
            Ok(work_fn("sync_repo", args.clone(), |_| Ok(Value::Null)))
        });
        registry
    }

    #[test]
    fn snapshot_restore_resets_scheduler() {
        let work = work_fn("sync_repo", serde_json::json!({"repo": "epel"}), |_| {
            Err(WorkError::Failed(anyhow::anyhow!("mirror offline")))
        });
        let task = Task::builder(work)
            .schedule(Interval::new(Duration::from_secs(3600)))
            .weight(2)
            .failure_threshold(5)
            .build();
        task.schedule().unwrap();
        task.restore_fields(|inner| inner.consecutive_failures = 3);

        let snapshot = task.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: TaskSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, snapshot);

        let restored = Task::from_snapshot(parsed, &registry()).unwrap();
        assert_eq!(restored.id(), task.id());
        assert_eq!(restored.name(), "sync_repo");
        assert_eq!(restored.args(), serde_json::json!({"repo": "epel"}));
        assert_eq!(restored.consecutive_failures(), 3);
        assert_eq!(restored.weight(), 2);
        assert_eq!(restored.failure_threshold(), Some(5));
        assert_eq!(restored.schedule_kind(), crate::tasking::scheduler::ScheduleKind::Immediate);
        assert_eq!(restored.scheduled_time(), None);
        restored.schedule().unwrap();
        assert!(restored.scheduled_time().is_some());
    }

    #[test]
    fn unknown_work_is_an_error() {
        let task = Task::builder(work_fn("mystery", Value::Null, |_| Ok(Value::Null))).build();
        assert!(Task::from_snapshot(task.snapshot(), &registry()).is_err());
    }

    #[test]
    fn store_save_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("tasks")).unwrap();
        let waiting = Task::builder(work_fn("sync_repo", Value::from(1), |_| Ok(Value::Null))).build();
        let finished = Task::builder(work_fn("sync_repo", Value::from(2), |_| Ok(Value::Null))).build();
        finished.restore_fields(|inner| inner.state = TaskState::Finished);
        store.save(&waiting.snapshot()).unwrap();
        store.save(&finished.snapshot()).unwrap();
        std::fs::write(store.dir().join("garbage.json"), b"{not json").unwrap();

        assert_eq!(store.load_all().unwrap().len(), 2);
        let recovered = store.recover(&registry()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id(), waiting.id());

        store.remove(waiting.id()).unwrap();
        store.remove(waiting.id()).unwrap();
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
