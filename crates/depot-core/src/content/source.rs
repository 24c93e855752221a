//! Content sources.

use anyhow::Result;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::ContentCatalog;
use super::cataloger::{Cataloger, CatalogerConduit};
use super::downloader::Downloader;
use super::report::RefreshReport;
use crate::control::CancelFlag;

/// Id of the implicit primary source, always tried last.
pub const PRIMARY_ID: &str = "___/primary/___";
pub const DEFAULT_MAX_CONCURRENT: usize = 2;
pub const DEFAULT_EXPIRES: Duration = Duration::from_secs(24 * 60 * 60);

/// Sources keyed by id.
pub type SourceMap = BTreeMap<String, Arc<ContentSource>>;

#[derive(Clone)]
pub enum SourceBackend {
    Cataloger(Arc<dyn Cataloger>),
    /// The primary source has no catalog; it downloads request URLs directly.
    Primary(Arc<dyn Downloader>),
}

/// An alternate location content can be downloaded from.
#[derive(Clone)]
pub struct ContentSource {
    pub id: String,
    pub name: String,
    /// Cataloger type from the descriptor.
    pub source_type: String,
    /// Lower is tried first.
    pub priority: u32,
    pub max_concurrent: usize,
    /// Lifetime of catalog entries recorded by a refresh.
    pub expires: Duration,
    pub base_url: String,
    pub paths: Vec<String>,
    pub enabled: bool,
    /// Descriptor keys not understood by the loader, for the cataloger to use.
    pub properties: BTreeMap<String, toml::Value>,
    backend: SourceBackend,
}

impl ContentSource {
    pub fn new(
        id: impl Into<String>,
        source_type: impl Into<String>,
        base_url: impl Into<String>,
        cataloger: Arc<dyn Cataloger>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            source_type: source_type.into(),
            priority: 0,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            expires: DEFAULT_EXPIRES,
            base_url: base_url.into(),
            paths: Vec::new(),
            enabled: true,
            properties: BTreeMap::new(),
            backend: SourceBackend::Cataloger(cataloger),
        }
    }

    /// The primary source: lowest precedence, downloads each request's own URL.
    pub fn primary(downloader: Arc<dyn Downloader>) -> Self {
        Self {
            id: PRIMARY_ID.to_string(),
            name: "primary".to_string(),
            source_type: String::new(),
            priority: u32::MAX,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            expires: DEFAULT_EXPIRES,
            base_url: String::new(),
            paths: Vec::new(),
            enabled: true,
            properties: BTreeMap::new(),
            backend: SourceBackend::Primary(downloader),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_expires(mut self, expires: Duration) -> Self {
        self.expires = expires;
        self
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.backend, SourceBackend::Primary(_))
    }

    pub fn backend(&self) -> &SourceBackend {
        &self.backend
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(toml::Value::as_str)
    }

    /// URLs to refresh: each path joined under `base_url` as a directory, or
    /// `base_url` alone. Never empty.
    pub fn urls(&self) -> Vec<String> {
        if self.paths.is_empty() {
            return vec![self.base_url.clone()];
        }
        let base = if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        };
        let parsed = url::Url::parse(&base);
        let mut urls = Vec::new();
        for path in &self.paths {
            let path = path.trim().trim_start_matches('/');
            if path.is_empty() || path == "\\" {
                continue;
            }
            let path = if path.ends_with('/') {
                path.to_string()
            } else {
                format!("{}/", path)
            };
            match &parsed {
                Ok(base) => match base.join(&path) {
                    Ok(joined) => urls.push(joined.to_string()),
                    Err(e) => {
                        tracing::warn!(source_id = %self.id, path = %path, "skipping path: {}", e)
                    }
                },
                Err(_) => urls.push(format!("{}{}", base, path)),
            }
        }
        if urls.is_empty() {
            urls.push(self.base_url.clone());
        }
        urls
    }

    /// Refreshes the catalog for every URL of this source, one report per URL
    /// attempted. Stops before the next URL once `cancel` is set.
    pub fn refresh(&self, cancel: &CancelFlag, catalog: &dyn ContentCatalog) -> Vec<RefreshReport> {
        let cataloger = match &self.backend {
            SourceBackend::Cataloger(c) => c,
            SourceBackend::Primary(_) => return Vec::new(),
        };
        let mut conduit = CatalogerConduit::new(self.id.clone(), self.expires, catalog);
        let mut reports = Vec::new();
        for url in self.urls() {
            if cancel.is_set() {
                tracing::debug!(source_id = %self.id, "refresh canceled");
                break;
            }
            conduit.reset();
            let mut report = RefreshReport::new(self.id.clone(), url.clone());
            match cataloger.refresh(&mut conduit, self, &url) {
                Ok(()) => {
                    report.succeeded = true;
                    tracing::info!(
                        source_id = %self.id,
                        url = %url,
                        added = conduit.added_count(),
                        deleted = conduit.deleted_count(),
                        "refreshed"
                    );
                }
                Err(e) => {
                    tracing::error!(source_id = %self.id, url = %url, "refresh failed: {:#}", e);
                    report.errors.push(format!("{:#}", e));
                }
            }
            report.added_count = conduit.added_count();
            report.deleted_count = conduit.deleted_count();
            reports.push(report);
        }
        reports
    }

    /// Downloader for this source's content.
    pub fn downloader(&self) -> Result<Arc<dyn Downloader>> {
        match &self.backend {
            SourceBackend::Cataloger(c) => c.downloader(self),
            SourceBackend::Primary(d) => Ok(Arc::clone(d)),
        }
    }
}

impl fmt::Debug for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentSource")
            .field("id", &self.id)
            .field("source_type", &self.source_type)
            .field("priority", &self.priority)
            .field("max_concurrent", &self.max_concurrent)
            .field("expires", &self.expires)
            .field("base_url", &self.base_url)
            .field("paths", &self.paths)
            .field("enabled", &self.enabled)
            .finish()
    }
}

impl PartialEq for ContentSource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContentSource {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::catalog::{InMemoryCatalog, UnitKey};
    use crate::content::test_support::NullDownloader;

    /// Adds one entry per URL; fails for URLs containing "bad".
    struct PerUrl;

    impl Cataloger for PerUrl {
        fn refresh(&self, conduit: &mut CatalogerConduit<'_>, _: &ContentSource, url: &str) -> Result<()> {
            if url.contains("bad") {
                anyhow::bail!("unreachable: {}", url);
            }
            let key = UnitKey::from([("url".to_string(), url.to_string())]);
            conduit.add_entry("file", key, url);
            Ok(())
        }

        fn downloader(&self, _: &ContentSource) -> Result<Arc<dyn Downloader>> {
            Ok(Arc::new(NullDownloader))
        }
    }

    fn source(base: &str) -> ContentSource {
        ContentSource::new("s", "per-url", base, Arc::new(PerUrl))
    }

    #[test]
    fn urls_without_paths_is_base_url() {
        assert_eq!(source("http://h/base").urls(), vec!["http://h/base".to_string()]);
    }

    #[test]
    fn urls_join_paths_as_directories() {
        let s = source("http://h/base").with_paths(["/fedora/18/x86_64", "fedora/19/", "\\", ""]);
        assert_eq!(
            s.urls(),
            vec![
                "http://h/base/fedora/18/x86_64/".to_string(),
                "http://h/base/fedora/19/".to_string(),
            ]
        );
        let only_separators = source("file:///unit/").with_paths(["\\"]);
        assert_eq!(only_separators.urls(), vec!["file:///unit/".to_string()]);
    }

    #[test]
    fn refresh_reports_each_url() {
        let catalog = InMemoryCatalog::new();
        let s = source("http://h/").with_paths(["good", "bad", "fine"]);
        let reports = s.refresh(&CancelFlag::new(), &catalog);
        assert_eq!(reports.len(), 3);
        assert!(reports[0].succeeded);
        assert_eq!(reports[0].added_count, 1);
        assert!(!reports[1].succeeded);
        assert_eq!(reports[1].errors.len(), 1);
        assert_eq!(reports[1].added_count, 0);
        assert!(reports[2].succeeded);
        assert_eq!(catalog.len(), 2);
    }

    #[test]
    fn refresh_stops_when_canceled() {
        let cancel = CancelFlag::new();
        cancel.set();
        let catalog = InMemoryCatalog::new();
        assert!(source("http://h/").refresh(&cancel, &catalog).is_empty());
    }

    #[test]
    fn primary_has_lowest_precedence_and_no_refresh() {
        let primary = ContentSource::primary(Arc::new(NullDownloader));
        assert_eq!(primary.id, PRIMARY_ID);
        assert_eq!(primary.priority, u32::MAX);
        assert!(primary.is_primary());
        assert!(primary.refresh(&CancelFlag::new(), &InMemoryCatalog::new()).is_empty());
        assert!(primary.downloader().is_ok());
    }
}
