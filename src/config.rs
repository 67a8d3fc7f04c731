use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for listenstat.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Persistent store configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Ingestion collector configuration.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Rollup and retention configuration.
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
}

/// SQLite store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database file path. Default: "listenstat.db".
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// How long a connection waits on a locked database. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,
}

/// Ingestion buffer and batch writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Bounded queue capacity between producers and the writer. Default: 1024.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Accumulated events that trigger an immediate flush. Default: 50.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Periodic flush interval. Default: 5s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// How long a high-value event waits for queue space. Default: 100ms.
    #[serde(default = "default_high_value_wait", with = "humantime_serde")]
    pub high_value_wait: Duration,

    /// Bound on the shutdown drain. Default: 10s.
    #[serde(default = "default_drain_timeout", with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Maximum entries in one submitted batch. Default: 500.
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,

    /// Retries after a failed flush transaction. Default: 2.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Initial backoff between flush retries, doubled per attempt. Default: 50ms.
    #[serde(default = "default_write_retry_backoff", with = "humantime_serde")]
    pub write_retry_backoff: Duration,
}

/// Rollup and retention configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MaintenanceConfig {
    /// Raw events older than this many days are pruned; 0 disables. Default: 0.
    #[serde(default)]
    pub retention_days: u32,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("listenstat.db")
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_high_value_wait() -> Duration {
    Duration::from_millis(100)
}

fn default_drain_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_batch_events() -> usize {
    crate::event::validate::DEFAULT_MAX_BATCH_EVENTS
}

fn default_write_retries() -> u32 {
    2
}

fn default_write_retry_backoff() -> Duration {
    Duration::from_millis(50)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            database: DatabaseConfig::default(),
            collector: CollectorConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout: default_busy_timeout(),
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            high_value_wait: default_high_value_wait(),
            drain_timeout: default_drain_timeout(),
            max_batch_events: default_max_batch_events(),
            write_retries: default_write_retries(),
            write_retry_backoff: default_write_retry_backoff(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.database.path.as_os_str().is_empty() {
            bail!("database.path is required");
        }

        self.collector.validate()
    }
}

impl CollectorConfig {
    /// Rejects zero sizes and intervals the writer loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("collector.queue_capacity must be positive");
        }
        if self.batch_size == 0 {
            bail!("collector.batch_size must be positive");
        }
        if self.flush_interval.is_zero() {
            bail!("collector.flush_interval must be positive");
        }
        if self.drain_timeout.is_zero() {
            bail!("collector.drain_timeout must be positive");
        }
        if self.max_batch_events == 0 {
            bail!("collector.max_batch_events must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.database.path, PathBuf::from("listenstat.db"));
        assert_eq!(cfg.collector.batch_size, 50);
        assert_eq!(cfg.collector.flush_interval, Duration::from_secs(5));
        assert_eq!(cfg.collector.high_value_wait, Duration::from_millis(100));
        assert_eq!(cfg.collector.drain_timeout, Duration::from_secs(10));
        assert_eq!(cfg.collector.max_batch_events, 500);
        assert_eq!(cfg.maintenance.retention_days, 0);
        cfg.validate().expect("defaults are valid");
    }

    #[test]
    fn test_parse_yaml_with_humantime() {
        let yaml = r#"
log_level: debug
database:
  path: /var/lib/listenstat/events.db
  busy_timeout: 2s
collector:
  queue_capacity: 16
  flush_interval: 250ms
  high_value_wait: 20ms
maintenance:
  retention_days: 90
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.database.busy_timeout, Duration::from_secs(2));
        assert_eq!(cfg.collector.queue_capacity, 16);
        assert_eq!(cfg.collector.flush_interval, Duration::from_millis(250));
        assert_eq!(cfg.collector.high_value_wait, Duration::from_millis(20));
        // Unset fields keep their defaults.
        assert_eq!(cfg.collector.batch_size, 50);
        assert_eq!(cfg.maintenance.retention_days, 90);
        cfg.validate().expect("valid");
    }

    #[test]
    fn test_validation_zero_queue_capacity() {
        let cfg = Config {
            collector: CollectorConfig {
                queue_capacity: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("queue_capacity"));
    }

    #[test]
    fn test_validation_zero_flush_interval() {
        let cfg = Config {
            collector: CollectorConfig {
                flush_interval: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("flush_interval"));
    }

    #[test]
    fn test_validation_empty_database_path() {
        let cfg = Config {
            database: DatabaseConfig {
                path: PathBuf::new(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("listenstat.yaml");
        std::fs::write(&path, "collector:\n  batch_size: 10\n").expect("write");

        let cfg = Config::load(&path).expect("load");
        assert_eq!(cfg.collector.batch_size, 10);

        std::fs::write(&path, "collector:\n  batch_size: 0\n").expect("write");
        assert!(Config::load(&path).is_err());
    }
}
