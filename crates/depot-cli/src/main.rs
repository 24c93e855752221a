use clap::Parser;
use depot_core::config::{self, LoggingConfig};
use depot_core::logging;

mod cli;

use crate::cli::Cli;

fn main() {
    let cli = Cli::parse();
    let cfg = config::load_or_init();

    // Logging follows the [logging] section; a broken config is reported below.
    let log_cfg = cfg
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_else(|_| LoggingConfig::default());
    if let Err(err) = logging::init_logging(&log_cfg) {
        logging::init_logging_stderr(&log_cfg);
        tracing::warn!("file logging unavailable, using stderr: {:#}", err);
    }

    if let Err(err) = cfg.and_then(|cfg| cli.run(cfg)) {
        eprintln!("depot error: {:#}", err);
        std::process::exit(1);
    }
}
