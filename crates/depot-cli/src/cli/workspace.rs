//! Config, catalog, and content sources shared by every command.

use anyhow::Result;
use depot_core::config::DepotConfig;
use depot_core::content::{
    Cataloger, CatalogerRegistry, ContentCatalog, ContentContainer, InMemoryCatalog,
    ManifestCataloger,
};
use std::path::PathBuf;
use std::sync::Arc;

pub struct Workspace {
    pub cfg: DepotConfig,
    pub catalog: Arc<InMemoryCatalog>,
    pub catalog_path: PathBuf,
    pub container: Arc<ContentContainer>,
}

impl Workspace {
    pub fn open(cfg: DepotConfig) -> Result<Self> {
        let catalog_path = InMemoryCatalog::default_path()?;
        Self::open_at(cfg, catalog_path)
    }

    pub fn open_at(cfg: DepotConfig, catalog_path: PathBuf) -> Result<Self> {
        let catalog = Arc::new(InMemoryCatalog::load_from_path(&catalog_path)?);
        let shared: Arc<dyn ContentCatalog> = catalog.clone();
        let container = ContentContainer::load(&cfg.content, &catalogers(&cfg), shared)?;
        Ok(Self {
            cfg,
            catalog,
            catalog_path,
            container: Arc::new(container),
        })
    }

    pub fn save_catalog(&self) -> Result<()> {
        self.catalog.save_to_path(&self.catalog_path)?;
        tracing::debug!(path = %self.catalog_path.display(), entries = self.catalog.len(), "saved catalog");
        Ok(())
    }
}

/// Cataloger plugins available to descriptors.
pub fn catalogers(cfg: &DepotConfig) -> CatalogerRegistry {
    let manifest: Arc<dyn Cataloger> = Arc::new(ManifestCataloger::new(&cfg.content));
    CatalogerRegistry::from([(ManifestCataloger::TYPE.to_string(), manifest)])
}
