//! Download requests and their candidate sources.

use std::path::PathBuf;
use std::sync::Arc;

use super::catalog::{ContentCatalog, UnitKey};
use super::source::{ContentSource, SourceMap};

/// A source and the URL to fetch from it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source: Arc<ContentSource>,
    pub url: String,
}

/// A unit to download to `destination`. `url` is where the primary source
/// fetches it.
#[derive(Debug, Clone)]
pub struct Request {
    pub type_id: String,
    pub unit_key: UnitKey,
    pub url: String,
    pub destination: PathBuf,
    pub downloaded: bool,
    /// One message per failed attempt, in attempt order.
    pub errors: Vec<String>,
    candidates: Vec<Candidate>,
    index: usize,
}

impl Request {
    pub fn new(
        type_id: impl Into<String>,
        unit_key: UnitKey,
        url: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            type_id: type_id.into(),
            unit_key,
            url: url.into(),
            destination: destination.into(),
            downloaded: false,
            errors: Vec::new(),
            candidates: Vec::new(),
            index: 0,
        }
    }

    /// Resolves candidates from the catalog: catalog matches of known sources
    /// ordered by priority (then source id, catalog order within a source),
    /// followed by the primary source with the request URL.
    pub fn find_sources(
        &mut self,
        primary: &Arc<ContentSource>,
        sources: &SourceMap,
        catalog: &dyn ContentCatalog,
    ) {
        let mut candidates: Vec<Candidate> = catalog
            .find(&self.type_id, &self.unit_key)
            .into_iter()
            .filter_map(|entry| match sources.get(&entry.source_id) {
                Some(source) => Some(Candidate {
                    source: Arc::clone(source),
                    url: entry.url,
                }),
                None => {
                    tracing::debug!(source_id = %entry.source_id, "catalog entry for unknown source");
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| {
            (a.source.priority, &a.source.id).cmp(&(b.source.priority, &b.source.id))
        });
        candidates.push(Candidate {
            source: Arc::clone(primary),
            url: self.url.clone(),
        });
        self.candidates = candidates;
        self.index = 0;
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn has_candidate(&self) -> bool {
        !self.downloaded && self.index < self.candidates.len()
    }

    /// Advances to the next untried candidate. `None` once downloaded or exhausted.
    pub fn next_candidate(&mut self) -> Option<Candidate> {
        if !self.has_candidate() {
            return None;
        }
        let candidate = self.candidates[self.index].clone();
        self.index += 1;
        Some(candidate)
    }
}
