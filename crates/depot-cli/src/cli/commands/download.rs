//! `depot download` – fetch a batch of requests from the best available source.

use anyhow::{Context, Result};
use depot_core::content::{CurlDownloader, Listener, Request, UnitKey};
use depot_core::control::CancelFlag;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cli::workspace::Workspace;

/// One entry of the requests file.
#[derive(Debug, Deserialize)]
pub struct RequestSpec {
    pub type_id: String,
    pub unit_key: UnitKey,
    /// Where the primary source serves the unit.
    pub url: String,
    pub destination: PathBuf,
}

pub fn load_requests(path: &Path) -> Result<Vec<Request>> {
    let bytes = std::fs::read(path).with_context(|| format!("read requests: {}", path.display()))?;
    let specs: Vec<RequestSpec> =
        serde_json::from_slice(&bytes).with_context(|| format!("parse requests: {}", path.display()))?;
    Ok(specs
        .into_iter()
        .map(|s| Request::new(s.type_id, s.unit_key, s.url, s.destination))
        .collect())
}

/// Logs each request as it settles.
struct LogListener;

impl Listener for LogListener {
    fn download_succeeded(&self, request: &Request) {
        tracing::info!(url = %request.url, dest = %request.destination.display(), "downloaded");
    }

    fn download_failed(&self, request: &Request) {
        tracing::warn!(url = %request.url, errors = ?request.errors, "download failed on every source");
    }
}

pub fn run_download(workspace: &Workspace, requests_path: &Path) -> Result<()> {
    let mut requests = load_requests(requests_path)?;
    let primary = Arc::new(CurlDownloader::new(&workspace.cfg.content));
    let report = workspace.container.download(
        &CancelFlag::new(),
        primary,
        &mut requests,
        Some(&LogListener),
    );
    workspace.save_catalog()?;

    println!("{:<20} {:>9} {:>6}", "SOURCE", "SUCCEEDED", "FAILED");
    for (source_id, details) in &report.downloads {
        println!(
            "{:<20} {:>9} {:>6}",
            source_id, details.total_succeeded, details.total_failed
        );
    }
    let failed: Vec<&Request> = requests.iter().filter(|r| !r.downloaded).collect();
    for request in &failed {
        println!("FAILED {} -> {}", request.url, request.destination.display());
        for error in &request.errors {
            println!("  {}", error);
        }
    }
    if !failed.is_empty() {
        anyhow::bail!("{} of {} downloads failed", failed.len(), requests.len());
    }
    Ok(())
}
