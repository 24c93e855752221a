//! Batch download strategies.

mod serial;
mod threaded;

pub use serial::SerialBatch;
pub use threaded::ThreadedBatch;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use super::catalog::ContentCatalog;
use super::downloader::Downloader;
use super::listener::Listener;
use super::report::DownloadReport;
use super::source::{ContentSource, SourceMap};
use crate::control::CancelFlag;

/// What every batch needs to resolve and download requests.
#[derive(Clone)]
struct BatchSetup<'a> {
    cancel: &'a CancelFlag,
    primary: Arc<ContentSource>,
    sources: &'a SourceMap,
    catalog: &'a dyn ContentCatalog,
    listener: Option<&'a dyn Listener>,
}

impl BatchSetup<'_> {
    fn new_report(&self) -> DownloadReport {
        DownloadReport {
            total_passes: 1,
            total_sources: self.sources.len(),
            ..DownloadReport::default()
        }
    }
}

/// One downloader per source, created on first use.
#[derive(Default)]
struct Downloaders {
    by_source: HashMap<String, Arc<dyn Downloader>>,
}

impl Downloaders {
    fn get(&mut self, source: &ContentSource) -> Result<Arc<dyn Downloader>> {
        if let Some(downloader) = self.by_source.get(&source.id) {
            return Ok(Arc::clone(downloader));
        }
        let downloader = source.downloader()?;
        self.by_source.insert(source.id.clone(), Arc::clone(&downloader));
        Ok(downloader)
    }
}
