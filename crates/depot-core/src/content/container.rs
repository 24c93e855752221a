//! The set of configured content sources plus their catalog.

use anyhow::Result;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::batch::{SerialBatch, ThreadedBatch};
use super::catalog::ContentCatalog;
use super::cataloger::CatalogerRegistry;
use super::descriptor::load_sources;
use super::downloader::Downloader;
use super::listener::Listener;
use super::report::{DownloadReport, RefreshReport};
use super::request::Request;
use super::source::{ContentSource, SourceMap};
use crate::config::{BatchStrategy, ContentConfig};
use crate::control::{panic_message, CancelFlag};

pub struct ContentContainer {
    sources: SourceMap,
    catalog: Arc<dyn ContentCatalog>,
    strategy: BatchStrategy,
    poll: Duration,
}

impl ContentContainer {
    /// Container over the enabled, non-primary `sources`.
    pub fn new(sources: Vec<ContentSource>, catalog: Arc<dyn ContentCatalog>) -> Self {
        let sources = sources
            .into_iter()
            .filter(|s| s.enabled && !s.is_primary())
            .map(|s| (s.id.clone(), Arc::new(s)))
            .collect();
        let config = ContentConfig::default();
        Self {
            sources,
            catalog,
            strategy: config.batch,
            poll: config.queue_poll(),
        }
    }

    /// Loads descriptors from the configured sources directory.
    pub fn load(
        config: &ContentConfig,
        catalogers: &CatalogerRegistry,
        catalog: Arc<dyn ContentCatalog>,
    ) -> Result<Self> {
        let dir = config.resolved_sources_dir()?;
        let sources = load_sources(&dir, catalogers)?;
        tracing::info!(dir = %dir.display(), count = sources.len(), "loaded content sources");
        Ok(Self::new(sources, catalog).with_config(config))
    }

    /// Takes the batch strategy and queue poll interval from `config`.
    pub fn with_config(mut self, config: &ContentConfig) -> Self {
        self.strategy = config.batch;
        self.poll = config.queue_poll();
        self
    }

    pub fn with_strategy(mut self, strategy: BatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn sources(&self) -> &SourceMap {
        &self.sources
    }

    pub fn catalog(&self) -> &Arc<dyn ContentCatalog> {
        &self.catalog
    }

    /// Refreshes every source that has no unexpired catalog entries (all of
    /// them when `force`), then drops expired entries. A source that fails
    /// outright yields one failed report with an empty URL.
    pub fn refresh(&self, cancel: &CancelFlag, force: bool) -> Vec<RefreshReport> {
        let mut reports = Vec::new();
        for (id, source) in &self.sources {
            if cancel.is_set() {
                break;
            }
            if !force && self.catalog.has_entries(id) {
                tracing::debug!(source_id = %id, "catalog current, skipping refresh");
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| source.refresh(cancel, self.catalog.as_ref()))) {
                Ok(source_reports) => reports.extend(source_reports),
                Err(panic) => {
                    let message = panic_message(&*panic);
                    tracing::error!(source_id = %id, "refresh failed: {}", message);
                    reports.push(RefreshReport::failure(id.clone(), String::new(), message));
                }
            }
        }
        let purged = self.catalog.purge_expired();
        if purged > 0 {
            tracing::info!(purged, "purged expired catalog entries");
        }
        reports
    }

    /// Refreshes stale sources, then downloads `requests` using the
    /// configured batch strategy. `primary` fetches each request's own URL
    /// when no alternate source succeeds.
    pub fn download(
        &self,
        cancel: &CancelFlag,
        primary: Arc<dyn Downloader>,
        requests: &mut [Request],
        listener: Option<&dyn Listener>,
    ) -> DownloadReport {
        self.refresh(cancel, false);
        let primary = Arc::new(ContentSource::primary(primary));
        let catalog = self.catalog.as_ref();
        let report = match self.strategy {
            BatchStrategy::Serial => {
                let mut batch = SerialBatch::new(cancel, primary, &self.sources, catalog);
                if let Some(listener) = listener {
                    batch = batch.with_listener(listener);
                }
                batch.download(requests)
            }
            BatchStrategy::Threaded => {
                let mut batch = ThreadedBatch::new(cancel, primary, &self.sources, catalog)
                    .with_poll(self.poll);
                if let Some(listener) = listener {
                    batch = batch.with_listener(listener);
                }
                batch.download(requests)
            }
        };
        tracing::info!(
            requests = requests.len(),
            succeeded = report.total_succeeded(),
            failed = report.total_failed(),
            "batch download finished"
        );
        report
    }

    /// Drops catalog entries of sources no longer configured.
    pub fn purge_orphans(&self) -> usize {
        let valid: HashSet<String> = self.sources.keys().cloned().collect();
        let purged = self.catalog.purge_orphans(&valid);
        if purged > 0 {
            tracing::info!(purged, "purged orphaned catalog entries");
        }
        purged
    }
}
