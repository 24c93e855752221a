//! Built-in `manifest` cataloger.
//!
//! Each source URL publishes `manifest.json`, a JSON array of
//! `{ "type_id", "unit_key", "path" }` objects. `path` is resolved against the
//! source URL to locate the unit.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::catalog::UnitKey;
use super::cataloger::{Cataloger, CatalogerConduit};
use super::curl::CurlDownloader;
use super::downloader::Downloader;
use super::source::ContentSource;
use crate::config::ContentConfig;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub type_id: String,
    pub unit_key: UnitKey,
    pub path: String,
}

pub struct ManifestCataloger {
    config: ContentConfig,
}

impl ManifestCataloger {
    pub const TYPE: &'static str = "manifest";

    pub fn new(config: &ContentConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl Cataloger for ManifestCataloger {
    fn refresh(
        &self,
        conduit: &mut CatalogerConduit<'_>,
        source: &ContentSource,
        url: &str,
    ) -> Result<()> {
        let base = if url.ends_with('/') {
            url.to_string()
        } else {
            format!("{}/", url)
        };
        let base_url = url::Url::parse(&base).with_context(|| format!("invalid source URL: {}", base))?;
        let manifest_url = base_url.join(MANIFEST_FILE).context("manifest URL")?;
        let body = CurlDownloader::for_source(source, &self.config).fetch(manifest_url.as_str())?;
        let entries: Vec<ManifestEntry> =
            serde_json::from_slice(&body).with_context(|| format!("parse {}", manifest_url))?;

        conduit.delete_under(&base);
        for entry in entries {
            match base_url.join(entry.path.trim_start_matches('/')) {
                Ok(unit_url) => conduit.add_entry(&entry.type_id, entry.unit_key, unit_url.as_str()),
                Err(e) => tracing::warn!(
                    source_id = %source.id,
                    path = %entry.path,
                    "skipping manifest entry: {}", e
                ),
            }
        }
        Ok(())
    }

    fn downloader(&self, source: &ContentSource) -> Result<Arc<dyn Downloader>> {
        Ok(Arc::new(CurlDownloader::for_source(source, &self.config)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::catalog::{ContentCatalog, InMemoryCatalog};
    use crate::content::test_support::unit;
    use crate::control::CancelFlag;

    fn write_manifest(dir: &std::path::Path, entries: &[ManifestEntry]) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(entries).unwrap()).unwrap();
    }

    fn entry(name: &str, path: &str) -> ManifestEntry {
        ManifestEntry {
            type_id: "rpm".to_string(),
            unit_key: unit(name),
            path: path.to_string(),
        }
    }

    #[test]
    fn refresh_records_manifest_entries_per_url() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(&dir.path().join("f18"), &[entry("zsh", "Packages/zsh.rpm"), entry("vim", "vim.rpm")]);
        write_manifest(&dir.path().join("f19"), &[entry("zsh", "/zsh.rpm")]);

        let config = ContentConfig::default();
        let cataloger = Arc::new(ManifestCataloger::new(&config));
        let base = url::Url::from_directory_path(dir.path()).unwrap().to_string();
        let source = ContentSource::new("local", ManifestCataloger::TYPE, base.clone(), cataloger)
            .with_paths(["f18", "f19", "missing"]);
        let catalog = InMemoryCatalog::new();

        let reports = source.refresh(&CancelFlag::new(), &catalog);
        assert_eq!(reports.len(), 3);
        assert!(reports[0].succeeded && reports[1].succeeded);
        assert_eq!(reports[0].added_count, 2);
        assert!(!reports[2].succeeded);
        assert_eq!(reports[2].errors.len(), 1);

        // same unit from the same source: the later URL wins
        let zsh = catalog.find("rpm", &unit("zsh"));
        assert_eq!(zsh.len(), 1);
        assert_eq!(zsh[0].url, format!("{}f19/zsh.rpm", base));
        let vim = catalog.find("rpm", &unit("vim"));
        assert_eq!(vim[0].url, format!("{}f18/vim.rpm", base));

        // refreshing again replaces this URL's entries
        write_manifest(&dir.path().join("f18"), &[]);
        let again = source.refresh(&CancelFlag::new(), &catalog);
        assert_eq!(again[0].deleted_count, 1);
        assert!(catalog.find("rpm", &unit("vim")).is_empty());
    }
}
