//! Downloader seam used by content sources.

use anyhow::Result;
use std::path::PathBuf;

/// One file to fetch. `tag` lets the caller match events back to its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub url: String,
    pub destination: PathBuf,
    pub tag: usize,
}

/// Receives per-item progress from a [`Downloader`].
pub trait DownloadEvents {
    fn download_started(&mut self, item: &DownloadItem);
    fn download_succeeded(&mut self, item: &DownloadItem);
    fn download_failed(&mut self, item: &DownloadItem, error: &str);
}

pub trait Downloader: Send + Sync {
    /// Fetches one item to its destination.
    fn download_one(&self, item: &DownloadItem) -> Result<()>;

    /// Fetches every item from `feed` in order, reporting each through `events`.
    /// `feed` may block waiting for more work; it ends when there is none.
    fn download(&self, feed: &mut dyn Iterator<Item = DownloadItem>, events: &mut dyn DownloadEvents) {
        for item in feed {
            events.download_started(&item);
            match self.download_one(&item) {
                Ok(()) => events.download_succeeded(&item),
                Err(e) => events.download_failed(&item, &format!("{:#}", e)),
            }
        }
    }
}
