//! Refresh and download reports.

use serde::Serialize;
use std::collections::BTreeMap;

/// Outcome of refreshing one URL of one content source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    pub source_id: String,
    /// Empty when the failure happened before any URL was attempted.
    pub url: String,
    pub succeeded: bool,
    pub added_count: usize,
    pub deleted_count: usize,
    pub errors: Vec<String>,
}

impl RefreshReport {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn failure(source_id: impl Into<String>, url: impl Into<String>, error: String) -> Self {
        Self {
            errors: vec![error],
            ..Self::new(source_id, url)
        }
    }
}

/// Per-source download totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadDetails {
    pub total_succeeded: usize,
    pub total_failed: usize,
}

/// Summary of one batch download.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub total_passes: usize,
    pub total_sources: usize,
    /// Keyed by source id; only sources that were attempted appear.
    pub downloads: BTreeMap<String, DownloadDetails>,
}

impl DownloadReport {
    pub(crate) fn details(&mut self, source_id: &str) -> &mut DownloadDetails {
        self.downloads.entry(source_id.to_string()).or_default()
    }

    pub fn total_succeeded(&self) -> usize {
        self.downloads.values().map(|d| d.total_succeeded).sum()
    }

    pub fn total_failed(&self) -> usize {
        self.downloads.values().map(|d| d.total_failed).sum()
    }
}
