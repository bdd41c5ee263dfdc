//! SQLite store
//!
//! Conventions:
//! - timestamps are epoch nanoseconds (INTEGER) so range filters compare numerically
//! - a missing log level is stored as an empty string, which keeps
//!   `level NOT IN (...)` true for unlabelled lines
//! - bounded deletes remove the lowest ids first

use super::{
    normalize_delete_limit, normalize_query_limit, ImportancePredicate, LogQuery, StatsQuery,
    Store,
};
use crate::error::{MonitorError, Result};
use crate::models::{Entity, LogRecord, MetricSample, StreamSource};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS container_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workload_id TEXT NOT NULL,
    workload_name TEXT NOT NULL,
    cpu_percent REAL NOT NULL,
    mem_usage_bytes INTEGER NOT NULL,
    mem_limit_bytes INTEGER NOT NULL,
    mem_percent REAL NOT NULL,
    net_rx_bytes INTEGER NOT NULL,
    net_tx_bytes INTEGER NOT NULL,
    block_read_bytes INTEGER NOT NULL,
    block_write_bytes INTEGER NOT NULL,
    process_count INTEGER NOT NULL,
    raw_snapshot TEXT NOT NULL,
    collected_at INTEGER NOT NULL,  -- epoch ns
    ingested_at INTEGER NOT NULL    -- epoch ns
);
CREATE INDEX IF NOT EXISTS idx_container_stats_collected_at ON container_stats(collected_at);
CREATE INDEX IF NOT EXISTS idx_container_stats_workload ON container_stats(workload_id, collected_at);

CREATE TABLE IF NOT EXISTS container_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    workload_id TEXT NOT NULL,
    workload_name TEXT NOT NULL,
    source TEXT NOT NULL,
    level TEXT NOT NULL DEFAULT '',
    message TEXT NOT NULL,
    raw_line TEXT NOT NULL,
    timestamp INTEGER NOT NULL,     -- epoch ns
    ingested_at INTEGER NOT NULL    -- epoch ns
);
CREATE INDEX IF NOT EXISTS idx_container_logs_timestamp ON container_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_container_logs_workload ON container_logs(workload_id, timestamp);
"#;

const STATS_COLUMNS: &str = "workload_id, workload_name, cpu_percent, mem_usage_bytes, \
    mem_limit_bytes, mem_percent, net_rx_bytes, net_tx_bytes, block_read_bytes, \
    block_write_bytes, process_count, raw_snapshot, collected_at, ingested_at";

const LOG_COLUMNS: &str =
    "workload_id, workload_name, source, level, message, raw_line, timestamp, ingested_at";

/// Epoch nanoseconds, saturating toward the side `at` lies on
fn nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(if at.timestamp() < 0 {
        i64::MIN
    } else {
        i64::MAX
    })
}

fn from_nanos(value: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(value)
}

fn int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn uint(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// SQLite-backed store; one connection shared behind a mutex, every call
/// runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path` and apply the schema
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| MonitorError::storage("open", format!("create directory: {e}")))?;
            }
            let conn = Connection::open(&path)
                .map_err(|e| MonitorError::storage("open", format!("{}: {e}", path.display())))?;
            conn.execute_batch(SCHEMA_SQL)
                .map_err(|e| MonitorError::storage("migrate", e))?;
            info!(path = %path.display(), "Opened SQLite store");
            Ok(conn)
        })
        .await
        .map_err(|e| MonitorError::storage("open", format!("task join error: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MonitorError::storage(operation, "connection mutex poisoned"))?;
            f(&mut guard).map_err(|e| MonitorError::storage(operation, e))
        })
        .await
        .map_err(|e| MonitorError::storage(operation, format!("task join error: {e}")))?
    }
}

fn table(entity: Entity) -> (&'static str, &'static str) {
    match entity {
        Entity::Stats => ("container_stats", "collected_at"),
        Entity::Logs => ("container_logs", "timestamp"),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<MetricSample> {
    Ok(MetricSample {
        workload_id: row.get(0)?,
        workload_name: row.get(1)?,
        cpu_percent: row.get(2)?,
        mem_usage_bytes: uint(row.get(3)?),
        mem_limit_bytes: uint(row.get(4)?),
        mem_percent: row.get(5)?,
        net_rx_bytes: uint(row.get(6)?),
        net_tx_bytes: uint(row.get(7)?),
        block_read_bytes: uint(row.get(8)?),
        block_write_bytes: uint(row.get(9)?),
        process_count: uint(row.get(10)?),
        raw_snapshot: row.get(11)?,
        collected_at: from_nanos(row.get(12)?),
        ingested_at: Some(from_nanos(row.get(13)?)),
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<LogRecord> {
    let source: String = row.get(2)?;
    let level: String = row.get(3)?;
    Ok(LogRecord {
        workload_id: row.get(0)?,
        workload_name: row.get(1)?,
        source: source.parse().unwrap_or(StreamSource::Stdout),
        level: level.parse().ok(),
        message: row.get(4)?,
        raw_line: row.get(5)?,
        timestamp: from_nanos(row.get(6)?),
        ingested_at: Some(from_nanos(row.get(7)?)),
    })
}

/// WHERE clause builder with positional parameters
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl Filter {
    fn push(&mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) {
        self.clauses.push(clause.into());
        self.params.extend(params);
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            self.clauses.join(" AND ")
        }
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_metric_samples(&self, batch: &[MetricSample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch = batch.to_vec();
        self.with_conn("insert stats", move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "INSERT INTO container_stats ({STATS_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ))?;
                let now = Utc::now();
                for s in &batch {
                    stmt.execute(params![
                        s.workload_id,
                        s.workload_name,
                        s.cpu_percent,
                        int(s.mem_usage_bytes),
                        int(s.mem_limit_bytes),
                        s.mem_percent,
                        int(s.net_rx_bytes),
                        int(s.net_tx_bytes),
                        int(s.block_read_bytes),
                        int(s.block_write_bytes),
                        int(s.process_count),
                        s.raw_snapshot,
                        nanos(s.collected_at),
                        nanos(s.ingested_at.unwrap_or(now)),
                    ])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn insert_log_records(&self, batch: &[LogRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch = batch.to_vec();
        self.with_conn("insert logs", move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(&format!(
                    "INSERT INTO container_logs ({LOG_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ))?;
                let now = Utc::now();
                for r in &batch {
                    stmt.execute(params![
                        r.workload_id,
                        r.workload_name,
                        r.source.as_str(),
                        r.level.map(|l| l.as_str()).unwrap_or(""),
                        r.message,
                        r.raw_line,
                        nanos(r.timestamp),
                        nanos(r.ingested_at.unwrap_or(now)),
                    ])?;
                }
            }
            tx.commit()
        })
        .await
    }

    async fn delete_before(
        &self,
        entity: Entity,
        cutoff: DateTime<Utc>,
        max_rows: usize,
    ) -> Result<u64> {
        let (table, column) = table(entity);
        let limit = normalize_delete_limit(max_rows) as i64;
        let sql = format!(
            "DELETE FROM {table} WHERE id IN \
             (SELECT id FROM {table} WHERE {column} < ?1 ORDER BY id LIMIT ?2)"
        );
        self.with_conn("delete before", move |conn| {
            conn.execute(&sql, params![nanos(cutoff), limit])
                .map(|n| n as u64)
        })
        .await
    }

    async fn delete_unimportant_in_range(
        &self,
        predicate: &ImportancePredicate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        max_rows: usize,
    ) -> Result<u64> {
        let (table, column) = table(predicate.entity());
        let mut filter = Filter::default();
        filter.push(
            format!("{column} >= ? AND {column} < ?"),
            [Value::Integer(nanos(from)), Value::Integer(nanos(to))],
        );

        match predicate {
            ImportancePredicate::Stats { cpu_high, mem_high } => {
                if *cpu_high > 0.0 {
                    filter.push("cpu_percent < ?", [Value::Real(*cpu_high)]);
                }
                if *mem_high > 0.0 {
                    filter.push("mem_percent < ?", [Value::Real(*mem_high)]);
                }
            }
            ImportancePredicate::Logs {
                keep_levels,
                keep_sources,
            } => {
                if !keep_levels.is_empty() {
                    filter.push(
                        format!("level NOT IN ({})", placeholders(keep_levels.len())),
                        keep_levels.iter().map(|l| Value::Text(l.as_str().into())),
                    );
                }
                if !keep_sources.is_empty() {
                    filter.push(
                        format!("source NOT IN ({})", placeholders(keep_sources.len())),
                        keep_sources.iter().map(|s| Value::Text(s.as_str().into())),
                    );
                }
            }
        }

        let mut params = filter.params.clone();
        params.push(Value::Integer(normalize_delete_limit(max_rows) as i64));
        let sql = format!(
            "DELETE FROM {table} WHERE id IN \
             (SELECT id FROM {table} WHERE {} ORDER BY id LIMIT ?)",
            filter.sql()
        );
        self.with_conn("delete range", move |conn| {
            conn.execute(&sql, params_from_iter(params))
                .map(|n| n as u64)
        })
        .await
    }

    async fn query_metric_samples(&self, query: &StatsQuery) -> Result<Vec<MetricSample>> {
        let mut filter = Filter::default();
        if let Some(id) = &query.workload_id {
            filter.push("workload_id = ?", [Value::Text(id.clone())]);
        }
        if let Some(name) = &query.workload_name {
            filter.push("workload_name = ?", [Value::Text(name.clone())]);
        }
        if let Some(from) = query.from {
            filter.push("collected_at >= ?", [Value::Integer(nanos(from))]);
        }
        if let Some(to) = query.to {
            filter.push("collected_at <= ?", [Value::Integer(nanos(to))]);
        }
        let order = if query.desc { "DESC" } else { "ASC" };
        let mut params = filter.params.clone();
        params.push(Value::Integer(normalize_query_limit(query.limit) as i64));
        let sql = format!(
            "SELECT {STATS_COLUMNS} FROM container_stats WHERE {} \
             ORDER BY collected_at {order}, id {order} LIMIT ?",
            filter.sql()
        );

        self.with_conn("query stats", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), sample_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn query_log_records(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let mut filter = Filter::default();
        if let Some(id) = &query.workload_id {
            filter.push("workload_id = ?", [Value::Text(id.clone())]);
        }
        if let Some(name) = &query.workload_name {
            filter.push("workload_name = ?", [Value::Text(name.clone())]);
        }
        if let Some(level) = query.level {
            filter.push("level = ?", [Value::Text(level.as_str().into())]);
        }
        if let Some(source) = query.source {
            filter.push("source = ?", [Value::Text(source.as_str().into())]);
        }
        if let Some(needle) = &query.contains {
            filter.push("instr(message, ?) > 0", [Value::Text(needle.clone())]);
        }
        if let Some(from) = query.from {
            filter.push("timestamp >= ?", [Value::Integer(nanos(from))]);
        }
        if let Some(to) = query.to {
            filter.push("timestamp <= ?", [Value::Integer(nanos(to))]);
        }
        let order = if query.desc { "DESC" } else { "ASC" };
        let mut params = filter.params.clone();
        params.push(Value::Integer(normalize_query_limit(query.limit) as i64));
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM container_logs WHERE {} \
             ORDER BY timestamp {order}, id {order} LIMIT ?",
            filter.sql()
        );

        self.with_conn("query logs", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), record_from_row)?;
            rows.collect()
        })
        .await
    }

    async fn count(&self, entity: Entity) -> Result<u64> {
        let (table, _) = table(entity);
        let sql = format!("SELECT COUNT(*) FROM {table}");
        self.with_conn("count", move |conn| {
            conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
                .map(uint)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogLevel;
    use chrono::Duration;
    use tempfile::TempDir;

    fn sample(cpu: f64, at: DateTime<Utc>) -> MetricSample {
        MetricSample {
            workload_id: "abc".into(),
            workload_name: "web".into(),
            cpu_percent: cpu,
            mem_usage_bytes: 1 << 20,
            mem_limit_bytes: 1 << 30,
            mem_percent: 0.1,
            net_rx_bytes: 5,
            net_tx_bytes: 6,
            block_read_bytes: 7,
            block_write_bytes: 8,
            process_count: 3,
            raw_snapshot: "{}".into(),
            collected_at: at,
            ingested_at: None,
        }
    }

    fn record(
        level: Option<LogLevel>,
        source: StreamSource,
        msg: &str,
        at: DateTime<Utc>,
    ) -> LogRecord {
        LogRecord {
            workload_id: "abc".into(),
            workload_name: "web".into(),
            source,
            level,
            message: msg.into(),
            raw_line: format!("{} {msg}", at.to_rfc3339()),
            timestamp: at,
            ingested_at: None,
        }
    }

    async fn open_temp() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("nested").join("monitor.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_insert_and_query_stats() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        store
            .insert_metric_samples(&[sample(1.5, now - Duration::seconds(5)), sample(2.5, now)])
            .await
            .unwrap();

        let rows = store
            .query_metric_samples(&StatsQuery {
                workload_id: Some("abc".into()),
                desc: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].cpu_percent, 2.5);
        assert_eq!(rows[0].collected_at, now);
        assert_eq!(rows[0].process_count, 3);
        assert!(rows[0].ingested_at.is_some());
    }

    #[tokio::test]
    async fn test_stats_tiers() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        store
            .insert_metric_samples(&[
                sample(1.0, now - Duration::days(8)),
                sample(10.0, now - Duration::days(5)),
                sample(99.0, now - Duration::days(5)),
                sample(1.0, now - Duration::days(1)),
            ])
            .await
            .unwrap();

        let deleted = store
            .delete_before(Entity::Stats, now - Duration::days(7), 100)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let predicate = ImportancePredicate::Stats {
            cpu_high: 80.0,
            mem_high: 80.0,
        };
        let deleted = store
            .delete_unimportant_in_range(
                &predicate,
                now - Duration::days(7),
                now - Duration::days(3),
                100,
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count(Entity::Stats).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_logs_tiers_keep_unlabelled_stderr() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        let mid = now - Duration::days(5);
        store
            .insert_log_records(&[
                record(None, StreamSource::Stdout, "old", now - Duration::days(8)),
                record(Some(LogLevel::Info), StreamSource::Stdout, "mid info", mid),
                record(None, StreamSource::Stdout, "mid plain", mid),
                record(None, StreamSource::Stderr, "mid stderr", mid),
                record(Some(LogLevel::Error), StreamSource::Stdout, "mid error", mid),
                record(Some(LogLevel::Info), StreamSource::Stdout, "new", now),
            ])
            .await
            .unwrap();

        let predicate = ImportancePredicate::Logs {
            keep_levels: vec![LogLevel::Error, LogLevel::Warn],
            keep_sources: vec![StreamSource::Stderr],
        };
        store
            .delete_before(Entity::Logs, now - Duration::days(7), 100)
            .await
            .unwrap();
        store
            .delete_unimportant_in_range(
                &predicate,
                now - Duration::days(7),
                now - Duration::days(3),
                100,
            )
            .await
            .unwrap();

        let rows = store.query_log_records(&LogQuery::default()).await.unwrap();
        let messages: Vec<_> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["mid stderr", "mid error", "new"]);
        assert_eq!(rows[1].level, Some(LogLevel::Error));
        assert_eq!(rows[0].level, None);
    }

    #[tokio::test]
    async fn test_delete_is_bounded() {
        let (_dir, store) = open_temp().await;
        let old = Utc::now() - Duration::days(30);
        let batch: Vec<_> = (0..12).map(|i| sample(1.0, old + Duration::seconds(i))).collect();
        store.insert_metric_samples(&batch).await.unwrap();

        let first = store.delete_before(Entity::Stats, Utc::now(), 5).await.unwrap();
        assert_eq!(first, 5);
        let remaining = store
            .query_metric_samples(&StatsQuery::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 7);
        assert_eq!(remaining[0].collected_at, old + Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_log_query_contains() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        store
            .insert_log_records(&[
                record(Some(LogLevel::Warn), StreamSource::Stderr, "warn: slow query", now),
                record(Some(LogLevel::Info), StreamSource::Stdout, "info: request ok", now),
            ])
            .await
            .unwrap();

        let rows = store
            .query_log_records(&LogQuery {
                contains: Some("slow".into()),
                source: Some(StreamSource::Stderr),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].level, Some(LogLevel::Warn));
    }

    #[test]
    fn test_out_of_range_times_saturate_by_side() {
        let ancient = Utc::now() - Duration::days(500 * 365);
        let distant = Utc::now() + Duration::days(500 * 365);
        assert_eq!(nanos(ancient), i64::MIN);
        assert_eq!(nanos(distant), i64::MAX);
    }

    #[tokio::test]
    async fn test_ancient_cutoff_deletes_nothing() {
        let (_dir, store) = open_temp().await;
        let now = Utc::now();
        store
            .insert_metric_samples(&[sample(1.0, now - Duration::minutes(1))])
            .await
            .unwrap();

        let ancient = now - Duration::days(500 * 365);
        let deleted = store.delete_before(Entity::Stats, ancient, 100).await.unwrap();
        assert_eq!(deleted, 0);

        let config = crate::config::RetentionConfig {
            idle_sleep: std::time::Duration::ZERO,
            stats: crate::config::StatsRetention {
                keep_all: std::time::Duration::from_secs(500 * 365 * 86_400),
                keep_anomaly_until: std::time::Duration::from_secs(500 * 365 * 86_400),
                ..Default::default()
            },
            ..Default::default()
        };
        let store = Arc::new(store);
        let enforcer = crate::retention::RetentionEnforcer::new(store.clone(), config).unwrap();
        let report = enforcer.run_once(now).await.unwrap();

        assert_eq!(report.stats.total(), 0);
        assert_eq!(store.count(Entity::Stats).await.unwrap(), 1);
    }
}
