//! Content catalog: which source can serve which unit, and from where.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Identifies a unit within its type.
pub type UnitKey = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub source_id: String,
    pub type_id: String,
    pub unit_key: UnitKey,
    pub url: String,
    pub expiration: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    fn same_unit(&self, source_id: &str, type_id: &str, unit_key: &UnitKey) -> bool {
        self.source_id == source_id && self.type_id == type_id && &self.unit_key == unit_key
    }
}

/// Storage for catalog entries. An entry is unique per `(source_id, type_id, unit_key)`.
pub trait ContentCatalog: Send + Sync {
    /// Adds an entry, replacing any entry for the same unit from the same source.
    /// Returns true when no entry was replaced.
    fn add_entry(&self, entry: CatalogEntry) -> bool;

    /// Removes the entry for a unit from one source. Returns the number removed.
    fn delete_entry(&self, source_id: &str, type_id: &str, unit_key: &UnitKey) -> usize;

    /// Removes all of a source's entries whose URL starts with `prefix`.
    fn delete_under(&self, source_id: &str, prefix: &str) -> usize;

    /// Unexpired entries for a unit, across all sources.
    fn find(&self, type_id: &str, unit_key: &UnitKey) -> Vec<CatalogEntry>;

    /// True when the source has at least one unexpired entry.
    fn has_entries(&self, source_id: &str) -> bool;

    fn purge_expired(&self) -> usize;

    /// Removes entries whose source id is not in `valid_ids`.
    fn purge_orphans(&self, valid_ids: &HashSet<String>) -> usize;
}

/// Catalog kept in memory, optionally persisted as JSON between runs.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<Vec<CatalogEntry>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default path for the catalog file: `~/.local/state/depot/catalog.json`.
    pub fn default_path() -> Result<PathBuf> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("depot")?;
        Ok(xdg_dirs.get_state_home().join("depot").join("catalog.json"))
    }

    /// Loads entries from `path`. A missing file yields an empty catalog.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::new()),
            Err(e) => return Err(e).with_context(|| format!("read catalog: {}", path.display())),
        };
        let entries: Vec<CatalogEntry> = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse catalog: {}", path.display()))?;
        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Saves all entries to `path` (creates the parent dir if needed).
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir: {}", parent.display()))?;
        }
        let json = {
            let entries = self.read();
            serde_json::to_string_pretty(&*entries).context("serialize catalog")?
        };
        std::fs::write(path, json).with_context(|| format!("write catalog: {}", path.display()))?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<CatalogEntry>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<CatalogEntry>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn retain(&self, mut keep: impl FnMut(&CatalogEntry) -> bool) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|e| keep(e));
        before - entries.len()
    }
}

impl ContentCatalog for InMemoryCatalog {
    fn add_entry(&self, entry: CatalogEntry) -> bool {
        let mut entries = self.write();
        match entries
            .iter_mut()
            .find(|e| e.same_unit(&entry.source_id, &entry.type_id, &entry.unit_key))
        {
            Some(existing) => {
                *existing = entry;
                false
            }
            None => {
                entries.push(entry);
                true
            }
        }
    }

    fn delete_entry(&self, source_id: &str, type_id: &str, unit_key: &UnitKey) -> usize {
        self.retain(|e| !e.same_unit(source_id, type_id, unit_key))
    }

    fn delete_under(&self, source_id: &str, prefix: &str) -> usize {
        self.retain(|e| !(e.source_id == source_id && e.url.starts_with(prefix)))
    }

    fn find(&self, type_id: &str, unit_key: &UnitKey) -> Vec<CatalogEntry> {
        let now = Utc::now();
        self.read()
            .iter()
            .filter(|e| e.type_id == type_id && &e.unit_key == unit_key && !e.is_expired(now))
            .cloned()
            .collect()
    }

    fn has_entries(&self, source_id: &str) -> bool {
        let now = Utc::now();
        self.read()
            .iter()
            .any(|e| e.source_id == source_id && !e.is_expired(now))
    }

    fn purge_expired(&self) -> usize {
        let now = Utc::now();
        self.retain(|e| !e.is_expired(now))
    }

    fn purge_orphans(&self, valid_ids: &HashSet<String>) -> usize {
        self.retain(|e| valid_ids.contains(&e.source_id))
    }
}
