use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Task queue parameters (`[tasking]` section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskingConfig {
    /// Maximum sum of task weights allowed to run at once.
    pub max_concurrency: usize,
    /// Seconds a completed task is retained before being culled.
    pub finished_lifetime_secs: u64,
    /// Consecutive failures after which a task is no longer scheduled.
    pub failure_threshold: Option<u32>,
    /// Start delay (seconds past the scheduled time) that triggers a warning.
    pub schedule_threshold_secs: Option<u64>,
    /// Dispatcher wake-up interval in milliseconds.
    pub dispatch_interval_ms: u64,
}

impl Default for TaskingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            finished_lifetime_secs: 3600,
            failure_threshold: None,
            schedule_threshold_secs: None,
            dispatch_interval_ms: 500,
        }
    }
}

impl TaskingConfig {
    pub fn finished_lifetime(&self) -> Duration {
        Duration::from_secs(self.finished_lifetime_secs)
    }

    pub fn schedule_threshold(&self) -> Option<Duration> {
        self.schedule_threshold_secs.map(Duration::from_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch_interval_ms.max(1))
    }
}

/// Batch strategy used by `ContentContainer::download`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStrategy {
    /// One request at a time, each candidate tried in order on the calling thread.
    Serial,
    /// One worker thread per content source; failures fall through to the next source.
    #[default]
    Threaded,
}

/// Content source and download parameters (`[content]` section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Directory containing `*.toml` content source descriptors.
    pub sources_dir: Option<PathBuf>,
    pub batch: BatchStrategy,
    /// How long worker queues block before re-checking cancel/halt (milliseconds).
    pub queue_poll_ms: u64,
    pub connect_timeout_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            sources_dir: None,
            batch: BatchStrategy::Threaded,
            queue_poll_ms: 500,
            connect_timeout_secs: 30,
            timeout_secs: 3600,
        }
    }
}

impl ContentConfig {
    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms.max(1))
    }

    /// Descriptor directory: configured value, else `~/.config/depot/sources.d`.
    pub fn resolved_sources_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.sources_dir {
            return Ok(dir.clone());
        }
        let xdg_dirs = xdg::BaseDirectories::with_prefix("depot")?;
        Ok(xdg_dirs.get_config_home().join("depot").join("sources.d"))
    }
}

/// Log output (`[logging]` section in config.toml). `RUST_LOG` overrides `filter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives.
    pub filter: String,
    /// Log file; relative paths resolve under `~/.local/state/depot`.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: crate::logging::DEFAULT_FILTER.to_string(),
            file: None,
        }
    }
}

/// Global configuration loaded from `~/.config/depot/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepotConfig {
    #[serde(default)]
    pub tasking: TaskingConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("depot")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<DepotConfig> {
    load_or_init_at(&config_path()?)
}

/// Same as `load_or_init` for an explicit path.
pub fn load_or_init_at(path: &Path) -> Result<DepotConfig> {
    if !path.exists() {
        let default_cfg = DepotConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml).with_context(|| format!("write config: {}", path.display()))?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data =
        fs::read_to_string(path).with_context(|| format!("read config: {}", path.display()))?;
    let cfg: DepotConfig =
        toml::from_str(&data).with_context(|| format!("parse config: {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = DepotConfig::default();
        assert_eq!(cfg.tasking.max_concurrency, 4);
        assert_eq!(cfg.tasking.finished_lifetime(), Duration::from_secs(3600));
        assert_eq!(cfg.tasking.dispatch_interval(), Duration::from_millis(500));
        assert!(cfg.tasking.failure_threshold.is_none());
        assert_eq!(cfg.content.batch, BatchStrategy::Threaded);
        assert_eq!(cfg.logging.filter, crate::logging::DEFAULT_FILTER);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = DepotConfig::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: DepotConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.tasking.max_concurrency, cfg.tasking.max_concurrency);
        assert_eq!(parsed.content.queue_poll_ms, cfg.content.queue_poll_ms);
    }

    #[test]
    fn config_toml_partial_sections() {
        let toml = r#"
            [tasking]
            max_concurrency = 3
            failure_threshold = 2
            schedule_threshold_secs = 10

            [content]
            batch = "serial"

            [logging]
            filter = "warn,depot_core=info"
        "#;
        let cfg: DepotConfig = toml::from_str(toml).unwrap();
        assert_eq!(cfg.tasking.max_concurrency, 3);
        assert_eq!(cfg.tasking.failure_threshold, Some(2));
        assert_eq!(cfg.tasking.schedule_threshold(), Some(Duration::from_secs(10)));
        assert_eq!(cfg.tasking.dispatch_interval_ms, 500);
        assert_eq!(cfg.content.batch, BatchStrategy::Serial);
        assert_eq!(cfg.content.connect_timeout_secs, 30);
        assert_eq!(cfg.logging.filter, "warn,depot_core=info");
        assert!(cfg.logging.file.is_none());
    }

    #[test]
    fn load_or_init_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let cfg = load_or_init_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.tasking.max_concurrency, 4);
        let again = load_or_init_at(&path).unwrap();
        assert_eq!(again.content.timeout_secs, cfg.content.timeout_secs);
    }
}
