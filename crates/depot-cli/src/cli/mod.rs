//! CLI for Depot.

mod commands;
mod workspace;

use anyhow::Result;
use clap::{Parser, Subcommand};
use depot_core::config::{BatchStrategy, DepotConfig};
use std::path::PathBuf;

use commands::{run_download, run_purge, run_refresh, run_sources};
use workspace::Workspace;

/// Top-level CLI for Depot.
#[derive(Debug, Parser)]
#[command(name = "depot")]
#[command(about = "Depot: download content from alternate sources, falling back to the primary", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// List the configured content sources.
    Sources,

    /// Refresh source catalogs through the task queue.
    Refresh {
        /// Refresh every source, even those whose catalog entries have not expired.
        #[arg(long)]
        force: bool,
    },

    /// Download the requests listed in a JSON file.
    Download {
        /// JSON array of `{type_id, unit_key, url, destination}` objects.
        requests: PathBuf,

        /// Override the configured batch strategy with the serial one.
        #[arg(long)]
        serial: bool,
    },

    /// Drop expired catalog entries and entries of sources no longer configured.
    Purge,
}

impl Cli {
    pub fn run(self, mut cfg: DepotConfig) -> Result<()> {
        tracing::debug!("loaded config: {:?}", cfg);
        if let CliCommand::Download { serial: true, .. } = self.command {
            cfg.content.batch = BatchStrategy::Serial;
        }
        let workspace = Workspace::open(cfg)?;

        match self.command {
            CliCommand::Sources => run_sources(&workspace)?,
            CliCommand::Refresh { force } => run_refresh(&workspace, force)?,
            CliCommand::Download { requests, .. } => run_download(&workspace, &requests)?,
            CliCommand::Purge => run_purge(&workspace)?,
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests;
