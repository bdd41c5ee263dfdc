//! In-memory store

use super::{
    normalize_delete_limit, normalize_query_limit, ImportancePredicate, LogQuery, StatsQuery,
    Store,
};
use crate::error::{MonitorError, Result};
use crate::models::{Entity, LogRecord, MetricSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Rows keyed by an increasing insertion id, so bounded deletes remove the
/// oldest-inserted rows first like the SQL backend does.
#[derive(Debug)]
struct Table<T> {
    next_id: u64,
    rows: Vec<(u64, T)>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            rows: Vec::new(),
        }
    }
}

impl<T: Clone> Table<T> {
    fn insert_all(&mut self, batch: &[T]) {
        for row in batch {
            self.rows.push((self.next_id, row.clone()));
            self.next_id += 1;
        }
    }

    /// Remove at most `max_rows` matching rows in id order
    fn delete_where(&mut self, max_rows: usize, mut pred: impl FnMut(&T) -> bool) -> u64 {
        let mut removed = 0usize;
        self.rows.retain(|(_, row)| {
            if removed < max_rows && pred(row) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed as u64
    }
}

/// Thread-safe store keeping every row in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    stats: Mutex<Table<MetricSample>>,
    logs: Mutex<Table<LogRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stats(&self) -> Result<std::sync::MutexGuard<'_, Table<MetricSample>>> {
        self.stats
            .lock()
            .map_err(|_| MonitorError::storage("lock", "stats table poisoned"))
    }

    fn logs(&self) -> Result<std::sync::MutexGuard<'_, Table<LogRecord>>> {
        self.logs
            .lock()
            .map_err(|_| MonitorError::storage("lock", "logs table poisoned"))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_metric_samples(&self, batch: &[MetricSample]) -> Result<()> {
        if !batch.is_empty() {
            self.stats()?.insert_all(batch);
        }
        Ok(())
    }

    async fn insert_log_records(&self, batch: &[LogRecord]) -> Result<()> {
        if !batch.is_empty() {
            self.logs()?.insert_all(batch);
        }
        Ok(())
    }

    async fn delete_before(
        &self,
        entity: Entity,
        cutoff: DateTime<Utc>,
        max_rows: usize,
    ) -> Result<u64> {
        let max_rows = normalize_delete_limit(max_rows);
        let deleted = match entity {
            Entity::Stats => self
                .stats()?
                .delete_where(max_rows, |s| s.collected_at < cutoff),
            Entity::Logs => self.logs()?.delete_where(max_rows, |r| r.timestamp < cutoff),
        };
        Ok(deleted)
    }

    async fn delete_unimportant_in_range(
        &self,
        predicate: &ImportancePredicate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_rows: usize,
    ) -> Result<u64> {
        let max_rows = normalize_delete_limit(max_rows);
        let deleted = match predicate.entity() {
            Entity::Stats => self.stats()?.delete_where(max_rows, |s| {
                s.collected_at >= from && s.collected_at < to && !predicate.keeps_sample(s)
            }),
            Entity::Logs => self.logs()?.delete_where(max_rows, |r| {
                r.timestamp >= from && r.timestamp < to && !predicate.keeps_record(r)
            }),
        };
        Ok(deleted)
    }

    async fn query_metric_samples(&self, query: &StatsQuery) -> Result<Vec<MetricSample>> {
        let mut rows: Vec<MetricSample> = self
            .stats()?
            .rows
            .iter()
            .filter(|(_, s)| query.matches(s))
            .map(|(_, s)| s.clone())
            .collect();
        rows.sort_by_key(|s| s.collected_at);
        if query.desc {
            rows.reverse();
        }
        rows.truncate(normalize_query_limit(query.limit));
        Ok(rows)
    }

    async fn query_log_records(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let mut rows: Vec<LogRecord> = self
            .logs()?
            .rows
            .iter()
            .filter(|(_, r)| query.matches(r))
            .map(|(_, r)| r.clone())
            .collect();
        rows.sort_by_key(|r| r.timestamp);
        if query.desc {
            rows.reverse();
        }
        rows.truncate(normalize_query_limit(query.limit));
        Ok(rows)
    }

    async fn count(&self, entity: Entity) -> Result<u64> {
        let count = match entity {
            Entity::Stats => self.stats()?.rows.len(),
            Entity::Logs => self.logs()?.rows.len(),
        };
        Ok(count as u64)
    }
}
