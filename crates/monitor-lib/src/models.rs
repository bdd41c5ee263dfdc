//! Core data models for the monitoring pipelines

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// One resource sample for one workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub workload_id: String,
    pub workload_name: String,
    pub cpu_percent: f64,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub mem_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub process_count: u64,
    /// Serialized runtime snapshot, replaced by a marker when over the size cap
    pub raw_snapshot: String,
    pub collected_at: DateTime<Utc>,
    /// Set when the sample is handed to the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
}

/// One line of workload output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub workload_id: String,
    pub workload_name: String,
    pub source: StreamSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    pub message: String,
    pub raw_line: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingested_at: Option<DateTime<Utc>>,
}

/// Output stream a log line was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(StreamSource::Stdout),
            "stderr" => Ok(StreamSource::Stderr),
            other => Err(format!("unknown stream source: {other}")),
        }
    }
}

/// Log level inferred from a line's message prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[serde(alias = "error")]
    Error,
    #[serde(alias = "warn")]
    Warn,
    #[serde(alias = "info")]
    Info,
    #[serde(alias = "debug")]
    Debug,
    #[serde(alias = "fatal")]
    Fatal,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Fatal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == upper)
            .ok_or_else(|| format!("unknown log level: {s}"))
    }
}

/// Persisted entity kinds subject to retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Entity {
    Stats,
    Logs,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Stats => "stats",
            Entity::Logs => "logs",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running workload as listed by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub id: String,
    pub name: String,
}

/// Inspection result used when attaching a tailer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDetails {
    pub name: String,
    /// Output is a single merged stream instead of multiplexed stdout/stderr
    pub tty: bool,
}

/// Lifecycle transitions reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Die,
    Stop,
    Destroy,
    Other(String),
}

impl LifecycleAction {
    pub fn parse(action: &str) -> Self {
        match action {
            "start" => LifecycleAction::Start,
            "die" => LifecycleAction::Die,
            "stop" => LifecycleAction::Stop,
            "destroy" => LifecycleAction::Destroy,
            other => LifecycleAction::Other(other.to_string()),
        }
    }

    /// Whether the workload's output ends with this transition
    pub fn ends_output(&self) -> bool {
        matches!(
            self,
            LifecycleAction::Die | LifecycleAction::Stop | LifecycleAction::Destroy
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub workload_id: String,
    pub action: LifecycleAction,
}

impl LifecycleEvent {
    pub fn new(workload_id: impl Into<String>, action: &str) -> Self {
        Self {
            workload_id: workload_id.into(),
            action: LifecycleAction::parse(action),
        }
    }
}

// Runtime snapshot shape. Every field tolerates absence and explicit nulls.

fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// One-shot resource snapshot in the Docker stats JSON layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSnapshot {
    #[serde(default)]
    pub read: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "nullable")]
    pub cpu_stats: CpuStats,
    #[serde(default, deserialize_with = "nullable")]
    pub precpu_stats: CpuStats,
    #[serde(default, deserialize_with = "nullable")]
    pub memory_stats: MemoryStats,
    #[serde(default, deserialize_with = "nullable")]
    pub networks: HashMap<String, NetworkStats>,
    #[serde(default, deserialize_with = "nullable")]
    pub blkio_stats: BlkioStats,
    #[serde(default, deserialize_with = "nullable")]
    pub pids_stats: PidsStats,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuStats {
    #[serde(default, deserialize_with = "nullable")]
    pub cpu_usage: CpuUsage,
    #[serde(default, deserialize_with = "nullable")]
    pub system_cpu_usage: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub online_cpus: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    #[serde(default, deserialize_with = "nullable")]
    pub total_usage: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub percpu_usage: Vec<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    #[serde(default, deserialize_with = "nullable")]
    pub usage: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub limit: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkStats {
    #[serde(default, deserialize_with = "nullable")]
    pub rx_bytes: u64,
    #[serde(default, deserialize_with = "nullable")]
    pub tx_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlkioStats {
    #[serde(default, deserialize_with = "nullable")]
    pub io_service_bytes_recursive: Vec<BlkioEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlkioEntry {
    #[serde(default, deserialize_with = "nullable")]
    pub op: String,
    #[serde(default, deserialize_with = "nullable")]
    pub value: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PidsStats {
    #[serde(default, deserialize_with = "nullable")]
    pub current: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parse() {
        assert_eq!("warn".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" FATAL ".parse::<LogLevel>(), Ok(LogLevel::Fatal));
        assert!("notice".parse::<LogLevel>().is_err());

        let levels: Vec<LogLevel> = serde_json::from_str(r#"["ERROR", "warn"]"#).unwrap();
        assert_eq!(levels, vec![LogLevel::Error, LogLevel::Warn]);
    }

    #[test]
    fn test_lifecycle_action_parse() {
        assert_eq!(LifecycleAction::parse("start"), LifecycleAction::Start);
        assert!(LifecycleAction::parse("destroy").ends_output());
        assert!(!LifecycleAction::parse("start").ends_output());
        assert_eq!(
            LifecycleAction::parse("pause"),
            LifecycleAction::Other("pause".to_string())
        );
    }

    #[test]
    fn test_snapshot_tolerates_nulls() {
        let json = r#"{
            "read": "2024-05-01T10:00:00.123456789Z",
            "cpu_stats": {"cpu_usage": {"total_usage": 200, "percpu_usage": null}, "online_cpus": null},
            "networks": null,
            "blkio_stats": {"io_service_bytes_recursive": null},
            "pids_stats": {}
        }"#;
        let snapshot: ContainerSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.cpu_stats.cpu_usage.total_usage, 200);
        assert!(snapshot.cpu_stats.cpu_usage.percpu_usage.is_empty());
        assert_eq!(snapshot.cpu_stats.online_cpus, 0);
        assert!(snapshot.networks.is_empty());
        assert_eq!(snapshot.pids_stats.current, 0);
        assert!(snapshot.read.is_some());
    }
}
