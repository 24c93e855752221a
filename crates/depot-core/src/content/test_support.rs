//! Fakes shared by the content unit tests.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::catalog::{CatalogEntry, ContentCatalog, InMemoryCatalog, UnitKey};
use super::cataloger::{Cataloger, CatalogerConduit};
use super::downloader::{DownloadItem, Downloader};
use super::listener::Listener;
use super::request::Request;
use super::source::{ContentSource, SourceMap};

/// Succeeds without touching the filesystem.
pub(crate) struct NullDownloader;

impl Downloader for NullDownloader {
    fn download_one(&self, _item: &DownloadItem) -> Result<()> {
        Ok(())
    }
}

/// Records nothing; hands out a `NullDownloader`.
pub(crate) struct NullCataloger;

impl Cataloger for NullCataloger {
    fn refresh(&self, _: &mut CatalogerConduit<'_>, _: &ContentSource, _: &str) -> Result<()> {
        Ok(())
    }

    fn downloader(&self, _: &ContentSource) -> Result<Arc<dyn Downloader>> {
        Ok(Arc::new(NullDownloader))
    }
}

pub(crate) fn unit(name: &str) -> UnitKey {
    UnitKey::from([("name".to_string(), name.to_string())])
}

/// Always fails.
pub(crate) struct FailingDownloader;

impl Downloader for FailingDownloader {
    fn download_one(&self, item: &DownloadItem) -> Result<()> {
        anyhow::bail!("refused: {}", item.url)
    }
}

/// Panics on every item.
pub(crate) struct PanickingDownloader;

impl Downloader for PanickingDownloader {
    fn download_one(&self, item: &DownloadItem) -> Result<()> {
        panic!("downloader exploded on {}", item.url)
    }
}

/// Cataloger that records nothing and hands out `downloader`.
pub(crate) struct StubCataloger {
    downloader: Arc<dyn Downloader>,
}

impl Cataloger for StubCataloger {
    fn refresh(&self, _: &mut CatalogerConduit<'_>, _: &ContentSource, _: &str) -> Result<()> {
        Ok(())
    }

    fn downloader(&self, _: &ContentSource) -> Result<Arc<dyn Downloader>> {
        Ok(Arc::clone(&self.downloader))
    }
}

pub(crate) fn stub_cataloger(downloader: Arc<dyn Downloader>) -> Arc<dyn Cataloger> {
    Arc::new(StubCataloger { downloader })
}

/// Sources `(id, priority, cataloger)`, each cataloging rpm `zsh` at `http://<id>/zsh`.
pub(crate) fn catalog_for(specs: &[(&str, u32, Arc<dyn Cataloger>)]) -> (SourceMap, InMemoryCatalog) {
    let catalog = InMemoryCatalog::new();
    let mut sources = SourceMap::new();
    for (id, priority, cataloger) in specs {
        let source = ContentSource::new(*id, "stub", format!("http://{}/", id), Arc::clone(cataloger))
            .with_priority(*priority);
        catalog.add_entry(CatalogEntry {
            source_id: id.to_string(),
            type_id: "rpm".to_string(),
            unit_key: unit("zsh"),
            url: format!("http://{}/zsh", id),
            expiration: Utc::now() + ChronoDuration::hours(1),
        });
        sources.insert(id.to_string(), Arc::new(source));
    }
    (sources, catalog)
}

/// Counts listener events as `(started, succeeded, failed)`.
#[derive(Default)]
pub(crate) struct CountingListener {
    started: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl CountingListener {
    pub(crate) fn counts(&self) -> (usize, usize, usize) {
        (
            self.started.load(Ordering::SeqCst),
            self.succeeded.load(Ordering::SeqCst),
            self.failed.load(Ordering::SeqCst),
        )
    }
}

impl Listener for CountingListener {
    fn download_started(&self, _: &Request) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn download_succeeded(&self, _: &Request) {
        self.succeeded.fetch_add(1, Ordering::SeqCst);
    }

    fn download_failed(&self, _: &Request) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }
}
