//! `depot refresh` – refresh catalogs as a queued task.
//!
//! Refresh tasks interrupted by a previous run are recovered from the task
//! snapshot store and run first; a new request identical to a recovered one is
//! dropped as a duplicate.

use anyhow::Result;
use depot_core::content::RefreshWork;
use depot_core::tasking::{
    SnapshotStore, Task, TaskError, TaskHandle, TaskQueue, TaskState, WorkItem, WorkRegistry,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::cli::workspace::Workspace;

pub fn run_refresh(workspace: &Workspace, force: bool) -> Result<()> {
    let store = SnapshotStore::open(SnapshotStore::default_dir()?)?;
    refresh_with_store(workspace, &store, force)
}

/// Refresh against an explicit snapshot store.
pub(crate) fn refresh_with_store(workspace: &Workspace, store: &SnapshotStore, force: bool) -> Result<()> {
    let registry = registry(workspace);
    let queue = TaskQueue::from_config(&workspace.cfg.tasking)?;

    let mut tasks = store.recover(&registry)?;
    if !tasks.is_empty() {
        tracing::info!(count = tasks.len(), "recovered interrupted refresh tasks");
    }
    tasks.push(Task::builder(RefreshWork::new(Arc::clone(&workspace.container), force)).build());

    let mut queued = Vec::new();
    for task in tasks {
        // Recovered tasks already have a snapshot on disk; a new one gets its
        // snapshot on enqueue.
        store.track(&task);
        match queue.enqueue(&task, true) {
            Ok(()) => queued.push(task),
            Err(TaskError::NonUnique { .. }) => {
                tracing::info!(task = %task.describe(), "identical refresh already queued");
                if let Err(e) = store.remove(task.id()) {
                    tracing::warn!(task_id = %task.id(), "drop duplicate snapshot: {:#}", e);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut failed = 0;
    for task in &queued {
        let state = wait_complete(task);
        print_reports(task);
        if state != TaskState::Finished {
            failed += 1;
            tracing::error!(task_id = %task.id(), ?state, exception = ?task.exception(), "refresh task did not finish");
        }
    }
    workspace.save_catalog()?;
    if failed > 0 {
        anyhow::bail!("{} refresh task(s) did not finish", failed);
    }
    Ok(())
}

fn registry(workspace: &Workspace) -> WorkRegistry {
    let container = Arc::clone(&workspace.container);
    let mut registry = WorkRegistry::new();
    registry.register(RefreshWork::NAME, move |args: &Value| {
        let force = args.get("force").and_then(Value::as_bool).unwrap_or(false);
        let work: Arc<dyn WorkItem> = RefreshWork::new(Arc::clone(&container), force);
        Ok(work)
    });
    registry
}

fn wait_complete(task: &TaskHandle) -> TaskState {
    loop {
        if let Some(state) = task.wait(Duration::from_secs(1)) {
            return state;
        }
        let progress = task.progress();
        if !progress.is_null() {
            tracing::debug!(task_id = %task.id(), %progress, "refresh in progress");
        }
    }
}

fn print_reports(task: &TaskHandle) {
    let Some(Value::Array(reports)) = task.result() else {
        return;
    };
    println!("{:<20} {:<6} {:>6} {:>8} {}", "SOURCE", "STATUS", "ADDED", "DELETED", "URL");
    for report in &reports {
        let source_id = report["source_id"].as_str().unwrap_or("-");
        let url = report["url"].as_str().unwrap_or("");
        let succeeded = report["succeeded"].as_bool().unwrap_or(false);
        let added = report["added_count"].as_u64().unwrap_or(0);
        let deleted = report["deleted_count"].as_u64().unwrap_or(0);
        if succeeded {
            tracing::info!(source_id, url, added, deleted, "refresh succeeded");
        } else {
            tracing::warn!(source_id, url, errors = %report["errors"], "refresh failed");
        }
        println!(
            "{:<20} {:<6} {:>6} {:>8} {}",
            source_id,
            if succeeded { "ok" } else { "FAILED" },
            added,
            deleted,
            url
        );
    }
}
