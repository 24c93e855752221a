//! Content source descriptors: TOML files, one table per source id.
//!
//! ```toml
//! [unit-world]
//! type = "manifest"
//! name = "Unit World"
//! priority = 1
//! max_concurrent = 10
//! expires = "3d"
//! base_url = "file:///unit-world/"
//! paths = ["fedora/18/x86_64", "fedora/19/x86_64"]
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::cataloger::CatalogerRegistry;
use super::source::{ContentSource, DEFAULT_EXPIRES, DEFAULT_MAX_CONCURRENT};

#[derive(Debug, Deserialize)]
struct Descriptor {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(rename = "type")]
    source_type: Option<String>,
    name: Option<String>,
    #[serde(default)]
    priority: u32,
    #[serde(default = "default_max_concurrent")]
    max_concurrent: usize,
    expires: Option<Expires>,
    base_url: Option<String>,
    paths: Option<Paths>,
    #[serde(flatten)]
    properties: BTreeMap<String, toml::Value>,
}

fn default_enabled() -> bool {
    true
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expires {
    Seconds(u64),
    Text(String),
}

/// A list, or one whitespace-separated string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Paths {
    List(Vec<String>),
    Text(String),
}

impl Paths {
    fn into_vec(self) -> Vec<String> {
        let all = match self {
            Paths::List(list) => list,
            Paths::Text(text) => text.split_whitespace().map(str::to_string).collect(),
        };
        all.into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && p != "\\")
            .collect()
    }
}

/// Parses an interval such as `30s`, `10m`, `24h`, `3d`, or bare seconds.
pub fn to_seconds(text: &str) -> Result<Duration> {
    let text = text.trim();
    let (number, unit) = match text.char_indices().last() {
        Some((at, c)) if c.is_ascii_alphabetic() => (&text[..at], c.to_ascii_lowercase()),
        _ => (text, 's'),
    };
    let value: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid interval: {:?}", text))?;
    let multiplier = match unit {
        's' => 1,
        'm' => 60,
        'h' => 60 * 60,
        'd' => 24 * 60 * 60,
        other => anyhow::bail!("invalid interval unit {:?} in {:?}", other, text),
    };
    let secs = value
        .checked_mul(multiplier)
        .with_context(|| format!("interval too large: {:?}", text))?;
    Ok(Duration::from_secs(secs))
}

/// Loads every enabled, valid source from `*.toml` files in `dir` (sorted by
/// file name). Invalid sources are logged and skipped; a later duplicate id
/// replaces an earlier one. A missing directory yields no sources.
pub fn load_sources(dir: &Path, catalogers: &CatalogerRegistry) -> Result<Vec<ContentSource>> {
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "no content source directory");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e).with_context(|| format!("read sources dir: {}", dir.display())),
    };
    let mut files = Vec::new();
    for entry in read {
        let path = entry
            .with_context(|| format!("read sources dir: {}", dir.display()))?
            .path();
        if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            files.push(path);
        }
    }
    files.sort();

    let mut sources: BTreeMap<String, ContentSource> = BTreeMap::new();
    for path in files {
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(path = %path.display(), "cannot read descriptor: {}", e);
                continue;
            }
        };
        let tables: BTreeMap<String, toml::Value> = match toml::from_str(&text) {
            Ok(tables) => tables,
            Err(e) => {
                tracing::error!(path = %path.display(), "cannot parse descriptor: {}", e);
                continue;
            }
        };
        for (id, value) in tables {
            match build_source(&id, value, catalogers) {
                Ok(Some(source)) => {
                    if sources.insert(id.clone(), source).is_some() {
                        tracing::warn!(source_id = %id, path = %path.display(), "duplicate content source replaced");
                    }
                }
                Ok(None) => tracing::debug!(source_id = %id, "content source disabled"),
                Err(e) => {
                    tracing::error!(source_id = %id, path = %path.display(), "invalid content source: {:#}", e)
                }
            }
        }
    }
    Ok(sources.into_values().collect())
}

fn build_source(
    id: &str,
    value: toml::Value,
    catalogers: &CatalogerRegistry,
) -> Result<Option<ContentSource>> {
    let descriptor: Descriptor = value.try_into().context("descriptor fields")?;
    if !descriptor.enabled {
        return Ok(None);
    }
    let source_type = descriptor.source_type.context("missing type")?;
    let base_url = descriptor.base_url.context("missing base_url")?;
    let cataloger = catalogers
        .get(&source_type)
        .with_context(|| format!("no cataloger for type {:?}", source_type))?;
    let expires = match descriptor.expires {
        None => DEFAULT_EXPIRES,
        Some(Expires::Seconds(secs)) => Duration::from_secs(secs),
        Some(Expires::Text(text)) => to_seconds(&text)?,
    };
    let mut source = ContentSource::new(id, source_type, base_url, Arc::clone(cataloger))
        .with_priority(descriptor.priority)
        .with_max_concurrent(descriptor.max_concurrent)
        .with_expires(expires)
        .with_paths(descriptor.paths.map(Paths::into_vec).unwrap_or_default());
    if let Some(name) = descriptor.name {
        source.name = name;
    }
    source.properties = descriptor.properties;
    Ok(Some(source))
}
