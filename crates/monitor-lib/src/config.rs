//! Pipeline configuration
//!
//! Every struct deserializes from a partial document: missing keys take the
//! defaults below, durations use human-readable strings such as `"10s"` or `"3d"`.
//! `with_defaults` replaces zero values with the defaults so a config
//! produced by hand (or from an empty env var) is always runnable.

use crate::error::{MonitorError, Result};
use crate::models::{LogLevel, StreamSource};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retention deletes are capped below common bound-variable limits
pub const MAX_DELETE_BATCH_ROWS: usize = 900;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for all three pipelines
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub stats: StatsConfig,
    pub logs: LogConfig,
    pub retention: RetentionConfig,
}

impl MonitorConfig {
    /// Normalize every section
    pub fn with_defaults(self) -> Self {
        Self {
            stats: self.stats.with_defaults(),
            logs: self.logs.with_defaults(),
            retention: self.retention.with_defaults(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.retention.validate()
    }
}

/// Stats sampler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,
    /// Time between sampling rounds (default: 10s)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Concurrent snapshot fetchers (default: max(2, available cores))
    pub workers: usize,
    /// Capacity of the job and result queues (default: 256)
    pub queue_size: usize,
    /// Samples per storage insert (default: 100)
    pub batch_size: usize,
    /// Longest time a sample waits in the write buffer (default: 2s)
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Raw snapshots above this size are replaced with a truncation marker (default: 1024)
    #[serde(alias = "max_raw_json_bytes")]
    pub max_raw_snapshot_bytes: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10),
            workers: default_workers(),
            queue_size: 256,
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
            max_raw_snapshot_bytes: 1024,
        }
    }
}

impl StatsConfig {
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.interval.is_zero() {
            self.interval = defaults.interval;
        }
        if self.workers == 0 {
            self.workers = defaults.workers;
        }
        if self.queue_size == 0 {
            self.queue_size = defaults.queue_size;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = defaults.flush_interval;
        }
        if self.max_raw_snapshot_bytes == 0 {
            self.max_raw_snapshot_bytes = 128 * 1024;
        }
        self
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(2)
}

/// Log collector configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// Capacity of the shared record queue; lines are dropped when full (default: 1024)
    pub queue_size: usize,
    /// Records per storage insert (default: 200)
    pub batch_size: usize,
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Longest accepted line; longer lines end that stream's scanner (default: 64 KiB)
    pub max_line_bytes: usize,
    /// Maximum concurrent tailers, 0 for unbounded (default: 256)
    pub tailer_limit: usize,
    /// Only collect output produced after the pipeline started (default: true)
    #[serde(alias = "since_from_start")]
    pub since_from_pipeline_start: bool,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_jitter: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_size: 1024,
            batch_size: 200,
            flush_interval: Duration::from_secs(1),
            max_line_bytes: 64 * 1024,
            tailer_limit: 256,
            since_from_pipeline_start: true,
            reconnect_delay: Duration::from_secs(2),
            reconnect_jitter: Duration::from_millis(500),
        }
    }
}

impl LogConfig {
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.queue_size == 0 {
            self.queue_size = defaults.queue_size;
        }
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = defaults.flush_interval;
        }
        if self.max_line_bytes == 0 {
            self.max_line_bytes = defaults.max_line_bytes;
        }
        if self.reconnect_delay.is_zero() {
            self.reconnect_delay = defaults.reconnect_delay;
        }
        self
    }
}

/// Retention enforcer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    /// Time between enforcement passes (default: 1h)
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Concurrent delete tasks, capped at the number of tasks (default: 2)
    pub workers: usize,
    /// Rows per delete statement, capped at 900 (default: 500)
    pub batch_rows: usize,
    /// Pause between delete batches (default: 50ms)
    #[serde(with = "humantime_serde")]
    pub idle_sleep: Duration,
    pub stats: StatsRetention,
    pub logs: LogRetention,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60 * 60),
            workers: 2,
            batch_rows: 500,
            idle_sleep: Duration::from_millis(50),
            stats: StatsRetention::default(),
            logs: LogRetention::default(),
        }
    }
}

impl RetentionConfig {
    pub fn with_defaults(mut self) -> Self {
        let defaults = Self::default();
        if self.interval.is_zero() {
            self.interval = defaults.interval;
        }
        if self.workers == 0 {
            self.workers = defaults.workers;
        }
        if self.batch_rows == 0 {
            self.batch_rows = defaults.batch_rows;
        }
        self.batch_rows = self.batch_rows.min(MAX_DELETE_BATCH_ROWS);
        self
    }

    /// Check that each tier-2 boundary lies beyond its keep-all window
    pub fn validate(&self) -> Result<()> {
        if self.stats.keep_anomaly_until < self.stats.keep_all {
            return Err(MonitorError::Config(format!(
                "retention.stats.keep_anomaly_until ({:?}) must not be shorter than keep_all ({:?})",
                self.stats.keep_anomaly_until, self.stats.keep_all
            )));
        }
        if self.logs.keep_important_until < self.logs.keep_all {
            return Err(MonitorError::Config(format!(
                "retention.logs.keep_important_until ({:?}) must not be shorter than keep_all ({:?})",
                self.logs.keep_important_until, self.logs.keep_all
            )));
        }
        for (name, window) in [
            ("stats.keep_all", self.stats.keep_all),
            ("stats.keep_anomaly_until", self.stats.keep_anomaly_until),
            ("logs.keep_all", self.logs.keep_all),
            ("logs.keep_important_until", self.logs.keep_important_until),
        ] {
            if chrono::Duration::from_std(window).is_err() {
                return Err(MonitorError::Config(format!(
                    "retention.{name} ({window:?}) is out of range"
                )));
            }
        }
        for (name, value) in [
            ("cpu_high", self.stats.cpu_high),
            ("mem_high", self.stats.mem_high),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(MonitorError::Config(format!(
                    "retention.stats.{name} must be a non-negative percentage, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Stats retention: keep everything, then keep only anomalous samples, then delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsRetention {
    #[serde(with = "humantime_serde")]
    pub keep_all: Duration,
    #[serde(with = "humantime_serde", alias = "keep_tier2_until")]
    pub keep_anomaly_until: Duration,
    /// Samples at or above this CPU percentage are kept in tier 1; 0 disables
    pub cpu_high: f64,
    /// Samples at or above this memory percentage are kept in tier 1; 0 disables
    pub mem_high: f64,
}

impl Default for StatsRetention {
    fn default() -> Self {
        Self {
            keep_all: 3 * DAY,
            keep_anomaly_until: 7 * DAY,
            cpu_high: 80.0,
            mem_high: 80.0,
        }
    }
}

/// Log retention: keep everything, then keep only important lines, then delete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogRetention {
    #[serde(with = "humantime_serde")]
    pub keep_all: Duration,
    #[serde(with = "humantime_serde", alias = "keep_tier2_until")]
    pub keep_important_until: Duration,
    pub keep_levels: Vec<LogLevel>,
    pub keep_sources: Vec<StreamSource>,
}

impl Default for LogRetention {
    fn default() -> Self {
        Self {
            keep_all: 3 * DAY,
            keep_important_until: 7 * DAY,
            keep_levels: vec![LogLevel::Error, LogLevel::Warn, LogLevel::Fatal],
            keep_sources: vec![StreamSource::Stderr],
        }
    }
}
