//! `depot sources` – list configured content sources.

use anyhow::Result;
use depot_core::content::ContentCatalog;

use crate::cli::workspace::Workspace;

pub fn run_sources(workspace: &Workspace) -> Result<()> {
    let sources = workspace.container.sources();
    if sources.is_empty() {
        println!("No content sources configured.");
        return Ok(());
    }
    println!(
        "{:<20} {:<10} {:>8} {:>6} {:<8} {}",
        "ID", "TYPE", "PRIORITY", "MAX", "CATALOG", "URLS"
    );
    for (id, source) in sources {
        let catalog = if workspace.catalog.has_entries(id) {
            "current"
        } else {
            "stale"
        };
        println!(
            "{:<20} {:<10} {:>8} {:>6} {:<8} {}",
            id,
            source.source_type,
            source.priority,
            source.max_concurrent,
            catalog,
            source.urls().join(" ")
        );
    }
    Ok(())
}
