//! Catalog refresh as a task queue work item.

use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::container::ContentContainer;
use crate::control::CancelFlag;
use crate::tasking::{TaskContext, WorkError, WorkItem, WorkResult};

const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Refreshes a container's sources; the task result is the list of
/// `RefreshReport`s. Canceling the task stops the refresh before its next URL.
pub struct RefreshWork {
    container: Arc<ContentContainer>,
    force: bool,
}

impl RefreshWork {
    pub const NAME: &'static str = "content.refresh";

    pub fn new(container: Arc<ContentContainer>, force: bool) -> Arc<Self> {
        Arc::new(Self { container, force })
    }
}

impl WorkItem for RefreshWork {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn args(&self) -> Value {
        json!({ "force": self.force })
    }

    fn execute(&self, ctx: &TaskContext) -> WorkResult {
        ctx.checkpoint()?;
        let cancel = CancelFlag::new();
        let done = CancelFlag::new();
        let reports = thread::scope(|s| {
            s.spawn(|| {
                while !done.is_set() {
                    if ctx.checkpoint().is_err() {
                        cancel.set();
                        break;
                    }
                    thread::sleep(INTERRUPT_POLL);
                }
            });
            let reports = self.container.refresh(&cancel, self.force);
            done.set();
            reports
        });
        ctx.checkpoint()?;
        let failed = reports.iter().filter(|r| !r.succeeded).count();
        ctx.set_progress(json!({ "urls": reports.len(), "failed": failed }));
        serde_json::to_value(&reports).map_err(|e| WorkError::Failed(e.into()))
    }
}
