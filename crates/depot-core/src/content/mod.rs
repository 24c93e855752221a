//! Alternate content sources: catalog refresh and multi-source batch downloads.
//!
//! A [`ContentSource`] is described by a TOML descriptor and backed by a
//! [`Cataloger`] that records which units it can serve in a [`ContentCatalog`].
//! [`ContentContainer::download`] resolves each [`Request`] against the catalog
//! and tries its candidate sources in priority order, falling back to the
//! primary source last.

mod batch;
mod catalog;
mod cataloger;
mod container;
mod curl;
mod descriptor;
mod downloader;
mod listener;
mod manifest;
mod report;
mod request;
mod source;
#[cfg(test)]
mod test_support;
mod work;

pub use batch::{SerialBatch, ThreadedBatch};
pub use catalog::{CatalogEntry, ContentCatalog, InMemoryCatalog, UnitKey};
pub use cataloger::{Cataloger, CatalogerConduit, CatalogerRegistry};
pub use container::ContentContainer;
pub use curl::CurlDownloader;
pub use descriptor::{load_sources, to_seconds};
pub use downloader::{DownloadEvents, DownloadItem, Downloader};
pub use listener::Listener;
pub use manifest::{ManifestCataloger, ManifestEntry, MANIFEST_FILE};
pub use report::{DownloadDetails, DownloadReport, RefreshReport};
pub use request::{Candidate, Request};
pub use source::{
    ContentSource, SourceBackend, SourceMap, DEFAULT_EXPIRES, DEFAULT_MAX_CONCURRENT, PRIMARY_ID,
};
pub use work::RefreshWork;
