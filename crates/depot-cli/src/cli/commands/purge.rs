//! `depot purge` – drop expired and orphaned catalog entries.

use anyhow::Result;
use depot_core::content::ContentCatalog;

use crate::cli::workspace::Workspace;

pub fn run_purge(workspace: &Workspace) -> Result<()> {
    let expired = workspace.catalog.purge_expired();
    let orphaned = workspace.container.purge_orphans();
    workspace.save_catalog()?;
    println!(
        "Purged {} expired and {} orphaned entries; {} remain.",
        expired,
        orphaned,
        workspace.catalog.len()
    );
    Ok(())
}
