//! Tiered retention enforcement
//!
//! Ages are measured back from the start of a pass. Per entity:
//! - younger than `keep_all`: never touched
//! - between `keep_all` and the second boundary: rows failing the importance
//!   predicate are deleted
//! - older than the second boundary: deleted unconditionally
//!
//! Each pass runs four independent delete tasks on a small worker pool. A task
//! deletes in bounded batches until a batch removes nothing. The first task
//! error aborts the pass; work already committed stays committed.

use crate::config::RetentionConfig;
use crate::error::{noop_handler, ErrorHandler, MonitorError, Result};
use crate::models::Entity;
use crate::observability::PipelineMetrics;
use crate::store::{ImportancePredicate, Store};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Retention tier a delete task enforces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Keep-important window
    Tier1,
    /// Delete-all window
    Tier2,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Tier1 => "tier1",
            Tier::Tier2 => "tier2",
        }
    }
}

/// Rows deleted per tier for one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub tier1: u64,
    pub tier2: u64,
}

impl TierCounts {
    pub fn total(&self) -> u64 {
        self.tier1 + self.tier2
    }
}

/// Outcome of one enforcement pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Reference time the tier boundaries were computed from
    pub now: DateTime<Utc>,
    pub stats: TierCounts,
    pub logs: TierCounts,
    pub elapsed_ms: u64,
}

impl PruneReport {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            stats: TierCounts::default(),
            logs: TierCounts::default(),
            elapsed_ms: 0,
        }
    }

    fn add(&mut self, entity: Entity, tier: Tier, rows: u64) {
        let counts = match entity {
            Entity::Stats => &mut self.stats,
            Entity::Logs => &mut self.logs,
        };
        match tier {
            Tier::Tier1 => counts.tier1 += rows,
            Tier::Tier2 => counts.tier2 += rows,
        }
    }

    pub fn total(&self) -> u64 {
        self.stats.total() + self.logs.total()
    }
}

/// One unit of work in a pass
#[derive(Debug, Clone)]
enum DeleteTask {
    Expired {
        entity: Entity,
        cutoff: DateTime<Utc>,
    },
    Unimportant {
        predicate: ImportancePredicate,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

impl DeleteTask {
    fn entity(&self) -> Entity {
        match self {
            DeleteTask::Expired { entity, .. } => *entity,
            DeleteTask::Unimportant { predicate, .. } => predicate.entity(),
        }
    }

    fn tier(&self) -> Tier {
        match self {
            DeleteTask::Expired { .. } => Tier::Tier2,
            DeleteTask::Unimportant { .. } => Tier::Tier1,
        }
    }

    async fn delete_batch(&self, store: &dyn Store, max_rows: usize) -> Result<u64> {
        match self {
            DeleteTask::Expired { entity, cutoff } => {
                store.delete_before(*entity, *cutoff, max_rows).await
            }
            DeleteTask::Unimportant {
                predicate,
                from,
                to,
            } => {
                store
                    .delete_unimportant_in_range(predicate, *from, *to, max_rows)
                    .await
            }
        }
    }
}

/// Batch size and pacing shared by every delete task of a pass
#[derive(Clone)]
struct Pacing {
    batch_rows: usize,
    idle_sleep: Duration,
}

/// Periodically prunes stored samples and log records
pub struct RetentionEnforcer {
    store: Arc<dyn Store>,
    config: RetentionConfig,
    on_error: ErrorHandler,
    metrics: PipelineMetrics,
}

impl RetentionEnforcer {
    /// Fails when a keep-important boundary is shorter than its keep-all window
    pub fn new(store: Arc<dyn Store>, config: RetentionConfig) -> Result<Self> {
        let config = config.with_defaults();
        config.validate()?;
        Ok(Self {
            store,
            config,
            on_error: noop_handler(),
            metrics: PipelineMetrics::new(),
        })
    }

    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = handler;
        self
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Prune immediately, then once per interval, until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            workers = self.config.workers,
            batch_rows = self.config.batch_rows,
            "Starting retention enforcer"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.prune(Utc::now(), &cancel).await {
                Ok(report) => info!(
                    stats_tier1 = report.stats.tier1,
                    stats_tier2 = report.stats.tier2,
                    logs_tier1 = report.logs.tier1,
                    logs_tier2 = report.logs.tier2,
                    elapsed_ms = report.elapsed_ms,
                    "Retention pass complete"
                ),
                Err(e) if e.is_cancelled() => break,
                Err(e) => return Err(e),
            }
        }

        info!("Retention enforcer stopped");
        Ok(())
    }

    /// Run a single pass with tier boundaries measured back from `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PruneReport> {
        self.prune(now, &CancellationToken::new()).await
    }

    async fn prune(&self, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<PruneReport> {
        let started = Instant::now();
        let tasks = self.plan(now);
        let workers = self.config.workers.clamp(1, tasks.len().max(1));
        debug!(tasks = tasks.len(), workers, "Retention pass starting");

        let pass = cancel.child_token();
        let queue = Arc::new(Mutex::new(VecDeque::from(tasks)));
        let pacing = Pacing {
            batch_rows: self.config.batch_rows,
            idle_sleep: self.config.idle_sleep,
        };
        let mut set = JoinSet::new();
        for _ in 0..workers {
            set.spawn(delete_worker(
                Arc::clone(&self.store),
                Arc::clone(&queue),
                pacing.clone(),
                pass.clone(),
                self.metrics.clone(),
            ));
        }

        let mut report = PruneReport::new(now);
        let mut failure: Option<MonitorError> = None;
        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .map_err(|e| MonitorError::from_join("retention worker", e))
                .and_then(|done| done);
            match outcome {
                Ok(done) => {
                    for (entity, tier, rows) in done {
                        report.add(entity, tier, rows);
                    }
                }
                Err(e) => {
                    pass.cancel();
                    if failure.is_none() && !e.is_cancelled() {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(err) = failure {
            self.report(&err);
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(MonitorError::Cancelled);
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        self.metrics.observe_retention_pass(elapsed.as_secs_f64());
        Ok(report)
    }

    /// Tier-2 deletes for both entities, plus tier-1 deletes whose window is non-empty
    fn plan(&self, now: DateTime<Utc>) -> Vec<DeleteTask> {
        let stats = &self.config.stats;
        let logs = &self.config.logs;
        let mut tasks = Vec::with_capacity(4);

        let stats_until = age_boundary(now, stats.keep_anomaly_until);
        let stats_keep_all = age_boundary(now, stats.keep_all);
        tasks.push(DeleteTask::Expired {
            entity: Entity::Stats,
            cutoff: stats_until,
        });
        if stats_until < stats_keep_all {
            tasks.push(DeleteTask::Unimportant {
                predicate: ImportancePredicate::Stats {
                    cpu_high: stats.cpu_high,
                    mem_high: stats.mem_high,
                },
                from: stats_until,
                to: stats_keep_all,
            });
        }

        let logs_until = age_boundary(now, logs.keep_important_until);
        let logs_keep_all = age_boundary(now, logs.keep_all);
        tasks.push(DeleteTask::Expired {
            entity: Entity::Logs,
            cutoff: logs_until,
        });
        if logs_until < logs_keep_all {
            tasks.push(DeleteTask::Unimportant {
                predicate: ImportancePredicate::Logs {
                    keep_levels: logs.keep_levels.clone(),
                    keep_sources: logs.keep_sources.clone(),
                },
                from: logs_until,
                to: logs_keep_all,
            });
        }
        tasks
    }

    fn report(&self, err: &MonitorError) {
        self.metrics.inc_pipeline_errors("retention");
        warn!(error = %err, "Retention pass failed");
        (self.on_error)(err);
    }
}

/// `now - age`, saturating at the earliest representable time
fn age_boundary(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

async fn delete_worker(
    store: Arc<dyn Store>,
    queue: Arc<Mutex<VecDeque<DeleteTask>>>,
    pacing: Pacing,
    pass: CancellationToken,
    metrics: PipelineMetrics,
) -> Result<Vec<(Entity, Tier, u64)>> {
    let mut done = Vec::new();
    loop {
        let next = queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front();
        let Some(task) = next else {
            return Ok(done);
        };
        let rows = drain_task(store.as_ref(), &task, &pacing, &pass, &metrics).await?;
        done.push((task.entity(), task.tier(), rows));
    }
}

/// Delete batches until one comes back empty
async fn drain_task(
    store: &dyn Store,
    task: &DeleteTask,
    pacing: &Pacing,
    pass: &CancellationToken,
    metrics: &PipelineMetrics,
) -> Result<u64> {
    let (entity, tier) = (task.entity(), task.tier());
    let mut total = 0u64;
    loop {
        if pass.is_cancelled() {
            return Err(MonitorError::Cancelled);
        }
        let deleted = task.delete_batch(store, pacing.batch_rows).await?;
        if deleted == 0 {
            debug!(entity = %entity, tier = tier.as_str(), rows = total, "Retention task done");
            return Ok(total);
        }
        total += deleted;
        metrics.add_rows_deleted(entity, tier.as_str(), deleted);

        if !pacing.idle_sleep.is_zero() {
            tokio::select! {
                _ = pass.cancelled() => return Err(MonitorError::Cancelled),
                _ = tokio::time::sleep(pacing.idle_sleep) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tests::{sample, RecordingStore};
    use crate::config::{LogRetention, StatsRetention};
    use crate::models::{LogLevel, LogRecord, StreamSource};
    use crate::store::{LogQuery, MemoryStore, StatsQuery};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STD_DAY: Duration = Duration::from_secs(86_400);

    fn config() -> RetentionConfig {
        RetentionConfig {
            batch_rows: 100,
            idle_sleep: Duration::ZERO,
            stats: StatsRetention {
                keep_all: 3 * STD_DAY,
                keep_anomaly_until: 7 * STD_DAY,
                cpu_high: 80.0,
                mem_high: 0.0,
            },
            logs: LogRetention {
                keep_all: 3 * STD_DAY,
                keep_important_until: 7 * STD_DAY,
                ..LogRetention::default()
            },
            ..RetentionConfig::default()
        }
    }

    fn aged_sample(
        id: &str,
        cpu: f64,
        now: DateTime<Utc>,
        age: chrono::Duration,
    ) -> crate::models::MetricSample {
        let mut s = sample(id, cpu);
        s.collected_at = now - age;
        s
    }

    fn record(
        message: &str,
        level: Option<LogLevel>,
        source: StreamSource,
        at: DateTime<Utc>,
    ) -> LogRecord {
        LogRecord {
            workload_id: "w".into(),
            workload_name: "web".into(),
            source,
            level,
            message: message.into(),
            raw_line: message.into(),
            timestamp: at,
            ingested_at: None,
        }
    }

    #[test]
    fn test_rejects_inverted_tiers() {
        let mut config = config();
        config.stats.keep_anomaly_until = STD_DAY;
        let result = RetentionEnforcer::new(Arc::new(MemoryStore::new()), config);
        assert!(matches!(result, Err(MonitorError::Config(_))));
    }

    #[tokio::test]
    async fn test_stats_tiers() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_metric_samples(&[
                aged_sample("hot-5d", 99.0, now, chrono::Duration::days(5)),
                aged_sample("idle-5d", 10.0, now, chrono::Duration::days(5)),
                aged_sample("hot-8d", 99.0, now, chrono::Duration::days(8)),
                aged_sample("idle-1d", 10.0, now, chrono::Duration::days(1)),
            ])
            .await
            .unwrap();
        let enforcer = RetentionEnforcer::new(store.clone(), config()).unwrap();

        let report = enforcer.run_once(now).await.unwrap();

        assert_eq!(report.stats, TierCounts { tier1: 1, tier2: 1 });
        assert_eq!(report.logs.total(), 0);
        let mut left: Vec<_> = store
            .query_metric_samples(&StatsQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.workload_id)
            .collect();
        left.sort();
        assert_eq!(left, vec!["hot-5d", "idle-1d"]);
    }

    #[tokio::test]
    async fn test_log_tiers() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let five_days = now - chrono::Duration::days(5);
        store
            .insert_log_records(&[
                record("keep-error", Some(LogLevel::Error), StreamSource::Stdout, five_days),
                record("keep-stderr", None, StreamSource::Stderr, five_days),
                record("drop-info", Some(LogLevel::Info), StreamSource::Stdout, five_days),
                record(
                    "drop-old",
                    Some(LogLevel::Error),
                    StreamSource::Stderr,
                    now - chrono::Duration::days(8),
                ),
                record(
                    "keep-recent",
                    Some(LogLevel::Info),
                    StreamSource::Stdout,
                    now - chrono::Duration::days(1),
                ),
            ])
            .await
            .unwrap();
        let enforcer = RetentionEnforcer::new(store.clone(), config()).unwrap();

        let report = enforcer.run_once(now).await.unwrap();

        assert_eq!(report.logs, TierCounts { tier1: 1, tier2: 1 });
        let mut left: Vec<_> = store
            .query_log_records(&LogQuery::default())
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.message)
            .collect();
        left.sort();
        assert_eq!(left, vec!["keep-error", "keep-recent", "keep-stderr"]);
    }

    #[tokio::test]
    async fn test_deletes_in_batches_until_empty() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let old: Vec<_> = (0..25)
            .map(|i| aged_sample(&format!("w{i}"), 99.0, now, chrono::Duration::days(10)))
            .collect();
        store.insert_metric_samples(&old).await.unwrap();
        let config = RetentionConfig {
            batch_rows: 10,
            workers: 8,
            ..config()
        };
        let enforcer = RetentionEnforcer::new(store.clone(), config).unwrap();

        let report = enforcer.run_once(now).await.unwrap();

        assert_eq!(report.stats.tier2, 25);
        assert_eq!(store.count(Entity::Stats).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_equal_boundaries_skip_tier1() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_metric_samples(&[aged_sample("idle-5d", 1.0, now, chrono::Duration::days(5))])
            .await
            .unwrap();
        let mut config = config();
        config.stats.keep_anomaly_until = config.stats.keep_all;
        let enforcer = RetentionEnforcer::new(store.clone(), config).unwrap();

        assert_eq!(enforcer.plan(now).len(), 3);
        let report = enforcer.run_once(now).await.unwrap();
        assert_eq!(report.stats, TierCounts { tier1: 0, tier2: 1 });
    }

    #[tokio::test]
    async fn test_delete_failure_aborts_pass() {
        let store = Arc::new(RecordingStore::default());
        store.fail_deletes.store(true, Ordering::SeqCst);
        let reported = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&reported);
        let enforcer = RetentionEnforcer::new(store, config())
            .unwrap()
            .with_error_handler(Arc::new(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            }));

        let err = enforcer.run_once(Utc::now()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Storage { .. }));
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_prunes_immediately_and_every_interval() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_metric_samples(&[aged_sample("old", 1.0, now, chrono::Duration::days(9))])
            .await
            .unwrap();
        let config = RetentionConfig {
            interval: Duration::from_secs(3600),
            ..config()
        };
        let enforcer = Arc::new(RetentionEnforcer::new(store.clone(), config).unwrap());

        let cancel = CancellationToken::new();
        let handle = {
            let enforcer = Arc::clone(&enforcer);
            let cancel = cancel.clone();
            tokio::spawn(async move { enforcer.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.count(Entity::Stats).await.unwrap(), 0);

        let old_again = aged_sample("old-again", 1.0, Utc::now(), chrono::Duration::days(9));
        store
            .insert_metric_samples(&[old_again])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert_eq!(store.count(Entity::Stats).await.unwrap(), 1);
        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert_eq!(store.count(Entity::Stats).await.unwrap(), 0);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_window_beyond_calendar_keeps_everything() {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();
        store
            .insert_metric_samples(&[aged_sample("recent", 1.0, now, chrono::Duration::minutes(1))])
            .await
            .unwrap();
        let forever = 1_000_000 * 365 * STD_DAY;
        let mut config = config();
        config.stats.keep_all = forever;
        config.stats.keep_anomaly_until = forever;
        let enforcer = RetentionEnforcer::new(store.clone(), config).unwrap();

        assert_eq!(age_boundary(now, forever), DateTime::<Utc>::MIN_UTC);
        let report = enforcer.run_once(now).await.unwrap();

        assert_eq!(report.stats.total(), 0);
        assert_eq!(store.count(Entity::Stats).await.unwrap(), 1);
    }
}
