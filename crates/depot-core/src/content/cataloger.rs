//! Cataloger plugin seam.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::catalog::{CatalogEntry, ContentCatalog, UnitKey};
use super::downloader::Downloader;
use super::source::ContentSource;

/// Cataloger plugins by descriptor `type`.
pub type CatalogerRegistry = HashMap<String, Arc<dyn Cataloger>>;

/// Discovers the content a source serves and how to fetch it.
pub trait Cataloger: Send + Sync {
    /// Records the units available at `url` through `conduit`.
    fn refresh(
        &self,
        conduit: &mut CatalogerConduit<'_>,
        source: &ContentSource,
        url: &str,
    ) -> Result<()>;

    /// Downloader used to fetch content from `source`.
    fn downloader(&self, source: &ContentSource) -> Result<Arc<dyn Downloader>>;
}

/// Write access to the catalog for one source, counting what a refresh changed.
pub struct CatalogerConduit<'a> {
    source_id: String,
    expires: Duration,
    catalog: &'a dyn ContentCatalog,
    added_count: usize,
    deleted_count: usize,
}

impl<'a> CatalogerConduit<'a> {
    pub fn new(source_id: impl Into<String>, expires: Duration, catalog: &'a dyn ContentCatalog) -> Self {
        Self {
            source_id: source_id.into(),
            expires,
            catalog,
            added_count: 0,
            deleted_count: 0,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn added_count(&self) -> usize {
        self.added_count
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted_count
    }

    /// Zeroes the counters before the next URL is refreshed.
    pub fn reset(&mut self) {
        self.added_count = 0;
        self.deleted_count = 0;
    }

    /// Records that the source serves `unit_key` at `url`, expiring after the
    /// source's `expires` interval.
    pub fn add_entry(&mut self, type_id: &str, unit_key: UnitKey, url: &str) {
        let ttl = ChronoDuration::from_std(self.expires).unwrap_or_else(|_| ChronoDuration::days(365));
        self.catalog.add_entry(CatalogEntry {
            source_id: self.source_id.clone(),
            type_id: type_id.to_string(),
            unit_key,
            url: url.to_string(),
            expiration: Utc::now() + ttl,
        });
        self.added_count += 1;
    }

    pub fn delete_entry(&mut self, type_id: &str, unit_key: &UnitKey) {
        self.deleted_count += self.catalog.delete_entry(&self.source_id, type_id, unit_key);
    }

    /// Drops every entry of this source whose URL starts with `prefix`.
    pub fn delete_under(&mut self, prefix: &str) {
        self.deleted_count += self.catalog.delete_under(&self.source_id, prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::catalog::InMemoryCatalog;

    #[test]
    fn conduit_counts_and_resets() {
        let catalog = InMemoryCatalog::new();
        let mut conduit = CatalogerConduit::new("s1", Duration::from_secs(60), &catalog);
        let key = UnitKey::from([("name".to_string(), "zsh".to_string())]);
        conduit.add_entry("rpm", key.clone(), "http://s1/zsh.rpm");
        conduit.add_entry("rpm", UnitKey::new(), "http://s1/other.rpm");
        assert_eq!(conduit.added_count(), 2);
        conduit.delete_entry("rpm", &key);
        conduit.delete_under("http://nowhere/");
        assert_eq!(conduit.deleted_count(), 1);
        assert_eq!(conduit.source_id(), "s1");
        conduit.reset();
        assert_eq!((conduit.added_count(), conduit.deleted_count()), (0, 0));
        assert!(catalog.has_entries("s1"));
    }
}
