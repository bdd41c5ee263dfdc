//! Persistence contract for samples and log records
//!
//! The pipelines only need batched inserts, bounded deletes and filtered
//! queries. Two implementations are provided:
//! - [`MemoryStore`], always available, used by tests and ephemeral runs
//! - `SqliteStore`, behind the `sqlite` feature

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{Entity, LogLevel, LogRecord, MetricSample, StreamSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_QUERY_LIMIT: usize = 200;
pub const MAX_QUERY_LIMIT: usize = 5000;
pub const DEFAULT_DELETE_LIMIT: usize = 500;
pub const MAX_DELETE_LIMIT: usize = 900;

/// Clamp a query limit: 0 selects the default
pub fn normalize_query_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_QUERY_LIMIT,
        n => n.min(MAX_QUERY_LIMIT),
    }
}

/// Clamp a delete batch size: 0 selects the default
pub fn normalize_delete_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_DELETE_LIMIT,
        n => n.min(MAX_DELETE_LIMIT),
    }
}

/// Row filter that marks records worth keeping in the middle retention tier
#[derive(Debug, Clone, PartialEq)]
pub enum ImportancePredicate {
    /// Anomalous samples: cpu or memory at or above a threshold. 0 disables a check.
    Stats { cpu_high: f64, mem_high: f64 },
    /// Lines whose level or source is allow-listed. Empty lists match nothing.
    Logs {
        keep_levels: Vec<LogLevel>,
        keep_sources: Vec<StreamSource>,
    },
}

impl ImportancePredicate {
    pub fn entity(&self) -> Entity {
        match self {
            ImportancePredicate::Stats { .. } => Entity::Stats,
            ImportancePredicate::Logs { .. } => Entity::Logs,
        }
    }

    pub fn keeps_sample(&self, sample: &MetricSample) -> bool {
        match self {
            ImportancePredicate::Stats { cpu_high, mem_high } => {
                (*cpu_high > 0.0 && sample.cpu_percent >= *cpu_high)
                    || (*mem_high > 0.0 && sample.mem_percent >= *mem_high)
            }
            ImportancePredicate::Logs { .. } => false,
        }
    }

    pub fn keeps_record(&self, record: &LogRecord) -> bool {
        match self {
            ImportancePredicate::Logs {
                keep_levels,
                keep_sources,
            } => {
                record.level.is_some_and(|level| keep_levels.contains(&level))
                    || keep_sources.contains(&record.source)
            }
            ImportancePredicate::Stats { .. } => false,
        }
    }
}

/// Filter for metric sample queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsQuery {
    pub workload_id: Option<String>,
    pub workload_name: Option<String>,
    /// Inclusive lower bound on `collected_at`
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `collected_at`
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
    /// Newest first when set
    pub desc: bool,
}

impl StatsQuery {
    pub fn matches(&self, sample: &MetricSample) -> bool {
        self.workload_id
            .as_deref()
            .map_or(true, |id| sample.workload_id == id)
            && self
                .workload_name
                .as_deref()
                .map_or(true, |name| sample.workload_name == name)
            && self.from.map_or(true, |from| sample.collected_at >= from)
            && self.to.map_or(true, |to| sample.collected_at <= to)
    }
}

/// Filter for log record queries
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub workload_id: Option<String>,
    pub workload_name: Option<String>,
    pub level: Option<LogLevel>,
    pub source: Option<StreamSource>,
    /// Substring of the message
    pub contains: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
    pub desc: bool,
}

impl LogQuery {
    pub fn matches(&self, record: &LogRecord) -> bool {
        self.workload_id
            .as_deref()
            .map_or(true, |id| record.workload_id == id)
            && self
                .workload_name
                .as_deref()
                .map_or(true, |name| record.workload_name == name)
            && self.level.map_or(true, |level| record.level == Some(level))
            && self.source.map_or(true, |source| record.source == source)
            && self
                .contains
                .as_deref()
                .map_or(true, |needle| record.message.contains(needle))
            && self.from.map_or(true, |from| record.timestamp >= from)
            && self.to.map_or(true, |to| record.timestamp <= to)
    }
}

/// Storage backend consumed by the pipelines
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert samples in one transaction; an empty batch is a no-op
    async fn insert_metric_samples(&self, batch: &[MetricSample]) -> Result<()>;

    /// Insert log records in one transaction; an empty batch is a no-op
    async fn insert_log_records(&self, batch: &[LogRecord]) -> Result<()>;

    /// Delete up to `max_rows` of the oldest-inserted rows older than `cutoff`
    async fn delete_before(
        &self,
        entity: Entity,
        cutoff: DateTime<Utc>,
        max_rows: usize,
    ) -> Result<u64>;

    /// Delete up to `max_rows` rows in `[from, to)` that the predicate does not keep
    async fn delete_unimportant_in_range(
        &self,
        predicate: &ImportancePredicate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_rows: usize,
    ) -> Result<u64>;

    async fn query_metric_samples(&self, query: &StatsQuery) -> Result<Vec<MetricSample>>;

    async fn query_log_records(&self, query: &LogQuery) -> Result<Vec<LogRecord>>;

    /// Number of stored rows of an entity
    async fn count(&self, entity: Entity) -> Result<u64>;
}
