//! Logging init driven by the `[logging]` config section.
//!
//! Output goes to a file under the XDG state dir unless that cannot be opened,
//! in which case the binary falls back to stderr. `RUST_LOG` overrides the
//! configured filter.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

pub const DEFAULT_FILTER: &str = "info,depot=debug,depot_core=debug";

/// Filter directives in effect: a non-empty `RUST_LOG`, else the configured filter.
fn directives(cfg: &LoggingConfig, env: Option<String>) -> String {
    env.filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| cfg.filter.clone())
}

fn env_filter(cfg: &LoggingConfig) -> EnvFilter {
    let wanted = directives(cfg, std::env::var(EnvFilter::DEFAULT_ENV).ok());
    EnvFilter::try_new(&wanted).unwrap_or_else(|e| {
        eprintln!("depot: invalid log filter {:?} ({}), using {:?}", wanted, e, DEFAULT_FILTER);
        EnvFilter::new(DEFAULT_FILTER)
    })
}

/// Log file path: `file` when set (relative paths resolve under `state_dir`),
/// else `state_dir/depot.log`.
pub fn log_file_path(cfg: &LoggingConfig, state_dir: &Path) -> PathBuf {
    match &cfg.file {
        Some(file) if file.is_absolute() => file.clone(),
        Some(file) => state_dir.join(file),
        None => state_dir.join("depot.log"),
    }
}

/// Install the file subscriber and return the log file path.
/// On failure (e.g. log dir unwritable), returns Err so the caller can fall back to stderr.
pub fn init_logging(cfg: &LoggingConfig) -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("depot")?;
    let path = log_file_path(cfg, &xdg_dirs.get_state_home().join("depot"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create log dir: {}", parent.display()))?;
    }
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file: {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter(cfg))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install subscriber: {}", e))?;

    tracing::info!("depot logging initialized at {}", path.display());
    Ok(path)
}

/// Stderr-only logging, for when `init_logging` fails.
pub fn init_logging_stderr(cfg: &LoggingConfig) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(cfg))
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}
