//! Daemon configuration
//!
//! Loaded from an optional file (`CMON_CONFIG`, default
//! `container-monitor.toml`) overlaid by `CMON_*` environment variables,
//! using `__` between nested keys: `CMON_MONITOR__STATS__INTERVAL=30s`.

use anyhow::{Context, Result};
use monitor_lib::MonitorConfig;
use serde::Deserialize;
use std::path::PathBuf;

pub const CONFIG_PATH_ENV: &str = "CMON_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "container-monitor.toml";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Default tracing filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Port for the health, metrics and query API
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// SQLite database file
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_port() -> u16 {
    9464
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("container-monitor.db")
}

impl AgentConfig {
    /// Load from the file named by `CMON_CONFIG` and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.into());
        Self::load_from(&path)
    }

    /// Load from `path` (which may be missing) and the environment
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("CMON")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {path}"))?;

        let mut loaded: AgentConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        loaded.monitor = loaded.monitor.with_defaults();
        loaded
            .monitor
            .validate()
            .context("invalid monitor configuration")?;
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = AgentConfig::load_from(path.to_str().unwrap()).unwrap();

        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.api_port, 9464);
        assert_eq!(cfg.storage.path, PathBuf::from("container-monitor.db"));
        assert_eq!(cfg.monitor.stats.interval, Duration::from_secs(10));
        assert!(cfg.monitor.retention.enabled);
    }

    #[test]
    fn test_file_values_and_env_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
api_port = 9999

[storage]
path = "/var/lib/cmon/monitor.db"

[monitor.stats]
interval = "30s"

[monitor.logs]
enabled = false

[monitor.retention.logs]
keep_all = "1d"
keep_important_until = "2d"
keep_levels = ["error"]
"#
        )
        .unwrap();

        std::env::set_var("CMON_MONITOR__RETENTION__WORKERS", "3");
        let cfg = AgentConfig::load_from(file.path().to_str().unwrap()).unwrap();
        std::env::remove_var("CMON_MONITOR__RETENTION__WORKERS");

        assert_eq!(cfg.api_port, 9999);
        assert_eq!(cfg.storage.path, PathBuf::from("/var/lib/cmon/monitor.db"));
        assert_eq!(cfg.monitor.stats.interval, Duration::from_secs(30));
        assert!(!cfg.monitor.logs.enabled);
        assert_eq!(cfg.monitor.retention.workers, 3);
        assert_eq!(
            cfg.monitor.retention.logs.keep_important_until,
            Duration::from_secs(2 * 86_400)
        );
        assert_eq!(
            cfg.monitor.retention.logs.keep_levels,
            vec![monitor_lib::LogLevel::Error]
        );
    }

    #[test]
    fn test_inverted_retention_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[monitor.retention.stats]\nkeep_all = \"7d\"\nkeep_anomaly_until = \"1d\""
        )
        .unwrap();

        let err = AgentConfig::load_from(file.path().to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("keep_anomaly_until"));
    }
}
