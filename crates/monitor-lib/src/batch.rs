//! Size-or-time batch writer
//!
//! Drains a bounded channel into a buffer and commits the buffer to the
//! store when it reaches `batch_size` or when `flush_interval` ticks,
//! whichever comes first. The writer runs until every sender is dropped,
//! then flushes what is left, so producers control shutdown by going away.

use crate::error::Result;
use crate::models::{Entity, LogRecord, MetricSample};
use crate::observability::PipelineMetrics;
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::debug;

/// Rows a [`BatchWriter`] knows how to persist
#[async_trait]
pub trait Ingest: Clone + Send + Sync + 'static {
    const ENTITY: Entity;

    fn time(&self) -> DateTime<Utc>;

    fn set_ingested_at(&mut self, at: DateTime<Utc>);

    async fn insert_batch(store: &dyn Store, batch: &[Self]) -> Result<()>;
}

#[async_trait]
impl Ingest for MetricSample {
    const ENTITY: Entity = Entity::Stats;

    fn time(&self) -> DateTime<Utc> {
        self.collected_at
    }

    fn set_ingested_at(&mut self, at: DateTime<Utc>) {
        self.ingested_at = Some(at);
    }

    async fn insert_batch(store: &dyn Store, batch: &[Self]) -> Result<()> {
        store.insert_metric_samples(batch).await
    }
}

#[async_trait]
impl Ingest for LogRecord {
    const ENTITY: Entity = Entity::Logs;

    fn time(&self) -> DateTime<Utc> {
        self.timestamp
    }

    fn set_ingested_at(&mut self, at: DateTime<Utc>) {
        self.ingested_at = Some(at);
    }

    async fn insert_batch(store: &dyn Store, batch: &[Self]) -> Result<()> {
        store.insert_log_records(batch).await
    }
}

/// Flush thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub flush_interval: Duration,
}

/// Buffers rows from a channel and writes them in batches
pub struct BatchWriter<T: Ingest> {
    store: Arc<dyn Store>,
    policy: BatchPolicy,
    buffer: Vec<T>,
    metrics: PipelineMetrics,
}

impl<T: Ingest> BatchWriter<T> {
    pub fn new(store: Arc<dyn Store>, policy: BatchPolicy) -> Self {
        let batch_size = policy.batch_size.max(1);
        Self {
            store,
            policy: BatchPolicy {
                batch_size,
                flush_interval: policy.flush_interval,
            },
            buffer: Vec::with_capacity(batch_size),
            metrics: PipelineMetrics::new(),
        }
    }

    /// Run until the channel closes. A failed flush is fatal and returned.
    pub async fn run(mut self, mut rx: mpsc::Receiver<T>) -> Result<()> {
        let period = self.policy.flush_interval;
        let mut ticker = interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(item) => {
                        self.buffer.push(item);
                        if self.buffer.len() >= self.policy.batch_size {
                            self.flush().await?;
                        }
                    }
                    None => {
                        self.flush().await?;
                        debug!(entity = %T::ENTITY, "Batch writer drained");
                        return Ok(());
                    }
                },
                _ = ticker.tick() => {
                    self.flush().await?;
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let capacity = self.policy.batch_size;
        let mut batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(capacity));

        let now = Utc::now();
        for row in &mut batch {
            let at = now.max(row.time());
            row.set_ingested_at(at);
        }

        let started = Instant::now();
        T::insert_batch(self.store.as_ref(), &batch).await?;
        self.metrics
            .observe_flush(T::ENTITY, batch.len(), started.elapsed().as_secs_f64());
        debug!(entity = %T::ENTITY, rows = batch.len(), "Flushed batch");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::MonitorError;
    use crate::models::Entity;
    use crate::store::{ImportancePredicate, LogQuery, MemoryStore, StatsQuery};
    use std::sync::Mutex;

    /// Store recording the size of every insert
    #[derive(Default)]
    pub(crate) struct RecordingStore {
        pub inner: MemoryStore,
        pub stats_flushes: Mutex<Vec<usize>>,
        pub log_flushes: Mutex<Vec<usize>>,
        pub fail_inserts: std::sync::atomic::AtomicBool,
        pub fail_deletes: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn insert_metric_samples(&self, batch: &[MetricSample]) -> Result<()> {
            if self.fail_inserts.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(MonitorError::storage("insert stats", "database is locked"));
            }
            self.stats_flushes.lock().unwrap().push(batch.len());
            self.inner.insert_metric_samples(batch).await
        }

        async fn insert_log_records(&self, batch: &[LogRecord]) -> Result<()> {
            if self.fail_inserts.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(MonitorError::storage("insert logs", "database is locked"));
            }
            self.log_flushes.lock().unwrap().push(batch.len());
            self.inner.insert_log_records(batch).await
        }

        async fn delete_before(
            &self,
            entity: Entity,
            cutoff: DateTime<Utc>,
            max_rows: usize,
        ) -> Result<u64> {
            if self.fail_deletes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(MonitorError::storage("delete", "disk I/O error"));
            }
            self.inner.delete_before(entity, cutoff, max_rows).await
        }

        async fn delete_unimportant_in_range(
            &self,
            predicate: &ImportancePredicate,
            from: DateTime<Utc>,
            to: DateTime<Utc>,
            max_rows: usize,
        ) -> Result<u64> {
            if self.fail_deletes.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(MonitorError::storage("delete", "disk I/O error"));
            }
            self.inner
                .delete_unimportant_in_range(predicate, from, to, max_rows)
                .await
        }

        async fn query_metric_samples(&self, query: &StatsQuery) -> Result<Vec<MetricSample>> {
            self.inner.query_metric_samples(query).await
        }

        async fn query_log_records(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
            self.inner.query_log_records(query).await
        }

        async fn count(&self, entity: Entity) -> Result<u64> {
            self.inner.count(entity).await
        }
    }

    pub(crate) fn sample(id: &str, cpu: f64) -> MetricSample {
        MetricSample {
            workload_id: id.to_string(),
            workload_name: format!("{id}-name"),
            cpu_percent: cpu,
            mem_usage_bytes: 0,
            mem_limit_bytes: 0,
            mem_percent: 0.0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            block_read_bytes: 0,
            block_write_bytes: 0,
            process_count: 0,
            raw_snapshot: "{}".into(),
            collected_at: Utc::now(),
            ingested_at: None,
        }
    }

    #[tokio::test]
    async fn test_size_threshold_then_final_flush() {
        let store = Arc::new(RecordingStore::default());
        let policy = BatchPolicy {
            batch_size: 100,
            flush_interval: Duration::from_secs(3600),
        };
        let writer = BatchWriter::<MetricSample>::new(store.clone(), policy);
        let (tx, rx) = mpsc::channel(512);

        for i in 0..250 {
            tx.send(sample("a", i as f64)).await.unwrap();
        }
        drop(tx);
        writer.run(rx).await.unwrap();

        assert_eq!(*store.stats_flushes.lock().unwrap(), vec![100, 100, 50]);
        let rows = store
            .query_metric_samples(&StatsQuery {
                limit: 1000,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 250);
        assert!(rows
            .iter()
            .all(|s| s.ingested_at.is_some_and(|at| at >= s.collected_at)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_threshold_flushes_partial_batch() {
        let store = Arc::new(RecordingStore::default());
        let policy = BatchPolicy {
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
        };
        let writer = BatchWriter::<MetricSample>::new(store.clone(), policy);
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(writer.run(rx));

        for _ in 0..3 {
            tx.send(sample("a", 1.0)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(*store.stats_flushes.lock().unwrap(), vec![3]);

        drop(tx);
        handle.await.unwrap().unwrap();
        assert_eq!(*store.stats_flushes.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_flush_failure_is_fatal() {
        let store = Arc::new(RecordingStore::default());
        store
            .fail_inserts
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let policy = BatchPolicy {
            batch_size: 2,
            flush_interval: Duration::from_secs(60),
        };
        let writer = BatchWriter::<MetricSample>::new(store.clone(), policy);
        let (tx, rx) = mpsc::channel(8);
        tx.send(sample("a", 1.0)).await.unwrap();
        tx.send(sample("a", 2.0)).await.unwrap();

        let err = writer.run(rx).await.unwrap_err();
        assert!(matches!(err, MonitorError::Storage { .. }));
    }
}
