//! Stats sampler
//!
//! Every `interval` (and once at start) the sampler lists running workloads and
//! queues one job per workload. A fixed pool of workers fetches a snapshot per
//! job, derives the sample and hands it to a [`BatchWriter`]. A failed fetch is
//! reported and skipped; a failed storage write stops the sampler.

use crate::batch::{BatchPolicy, BatchWriter};
use crate::config::StatsConfig;
use crate::error::{noop_handler, ErrorHandler, MonitorError, Result};
use crate::models::{ContainerSnapshot, CpuStats, MetricSample, WorkloadRef};
use crate::observability::PipelineMetrics;
use crate::runtime::WorkloadRuntime;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Periodic resource sampler for all running workloads
pub struct StatsSampler {
    runtime: Arc<dyn WorkloadRuntime>,
    store: Arc<dyn Store>,
    config: StatsConfig,
    on_error: ErrorHandler,
    metrics: PipelineMetrics,
}

impl StatsSampler {
    pub fn new(
        runtime: Arc<dyn WorkloadRuntime>,
        store: Arc<dyn Store>,
        config: StatsConfig,
    ) -> Self {
        Self {
            runtime,
            store,
            config: config.with_defaults(),
            on_error: noop_handler(),
            metrics: PipelineMetrics::new(),
        }
    }

    /// Receive per-workload fetch failures
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = handler;
        self
    }

    pub fn config(&self) -> &StatsConfig {
        &self.config
    }

    /// Sample until `cancel` fires or a storage write fails
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let scope = cancel.child_token();
        let (job_tx, job_rx) = mpsc::channel::<WorkloadRef>(self.config.queue_size);
        let (result_tx, result_rx) = mpsc::channel::<MetricSample>(self.config.queue_size);

        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            "Starting stats sampler"
        );

        let writer = BatchWriter::<MetricSample>::new(
            Arc::clone(&self.store),
            BatchPolicy {
                batch_size: self.config.batch_size,
                flush_interval: self.config.flush_interval,
            },
        );
        let writer_scope = scope.clone();
        let writer_task = tokio::spawn(async move {
            let result = writer.run(result_rx).await;
            if result.is_err() {
                writer_scope.cancel();
            }
            result
        });

        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut workers = JoinSet::new();
        for _ in 0..self.config.workers {
            let worker = SampleWorker {
                runtime: Arc::clone(&self.runtime),
                on_error: Arc::clone(&self.on_error),
                metrics: self.metrics.clone(),
                max_raw_bytes: self.config.max_raw_snapshot_bytes,
            };
            workers.spawn(worker.run(scope.clone(), Arc::clone(&job_rx), result_tx.clone()));
        }
        drop(result_tx);

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                _ = ticker.tick() => self.enqueue_once(&scope, &job_tx).await,
            }
        }

        debug!("Stats sampler stopping, draining workers");
        drop(job_tx);
        let mut worker_failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                let err = MonitorError::from_join("stats worker", e);
                if !err.is_cancelled() && worker_failure.is_none() {
                    worker_failure = Some(err);
                }
            }
        }

        writer_task
            .await
            .map_err(|e| MonitorError::from_join("stats writer", e))??;
        if let Some(err) = worker_failure {
            return Err(err);
        }
        info!("Stats sampler stopped");
        Ok(())
    }

    async fn enqueue_once(&self, scope: &CancellationToken, jobs: &mpsc::Sender<WorkloadRef>) {
        let listed = tokio::select! {
            _ = scope.cancelled() => return,
            listed = self.runtime.list_running() => listed,
        };
        let workloads = match listed {
            Ok(workloads) => workloads,
            Err(e) => {
                self.report(&e);
                return;
            }
        };
        debug!(workloads = workloads.len(), "Queueing stats jobs");

        for workload in workloads {
            tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                sent = jobs.send(workload) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn report(&self, err: &MonitorError) {
        self.metrics.inc_pipeline_errors("stats");
        warn!(error = %err, "Stats sampler error");
        (self.on_error)(err);
    }
}

/// One member of the fetch pool
struct SampleWorker {
    runtime: Arc<dyn WorkloadRuntime>,
    on_error: ErrorHandler,
    metrics: PipelineMetrics,
    max_raw_bytes: usize,
}

impl SampleWorker {
    async fn run(
        self,
        scope: CancellationToken,
        jobs: Arc<Mutex<mpsc::Receiver<WorkloadRef>>>,
        results: mpsc::Sender<MetricSample>,
    ) {
        loop {
            let job = {
                let mut jobs = jobs.lock().await;
                tokio::select! {
                    biased;
                    _ = scope.cancelled() => None,
                    job = jobs.recv() => job,
                }
            };
            let Some(job) = job else { break };

            let fetched = tokio::select! {
                _ = scope.cancelled() => break,
                fetched = self.sample(&job) => fetched,
            };
            match fetched {
                Ok(sample) => {
                    self.metrics.inc_samples_collected();
                    tokio::select! {
                        biased;
                        sent = results.send(sample) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = scope.cancelled() => break,
                    }
                }
                Err(e) => {
                    self.metrics.inc_sample_failures();
                    self.metrics.inc_pipeline_errors("stats");
                    debug!(workload_id = %job.id, error = %e, "Skipping workload sample");
                    (self.on_error)(&e);
                }
            }
        }
    }

    async fn sample(&self, job: &WorkloadRef) -> Result<MetricSample> {
        let raw = self.runtime.sample_once(&job.id).await?;
        build_sample(job, &raw, self.max_raw_bytes, Utc::now())
    }
}

/// Derive a sample from a raw runtime snapshot
pub fn build_sample(
    workload: &WorkloadRef,
    raw: &serde_json::Value,
    max_raw_bytes: usize,
    now: DateTime<Utc>,
) -> Result<MetricSample> {
    let snapshot = ContainerSnapshot::deserialize(raw)?;

    let mem_usage = snapshot.memory_stats.usage;
    let mem_limit = snapshot.memory_stats.limit;
    let (net_rx, net_tx) = snapshot
        .networks
        .values()
        .fold((0u64, 0u64), |(rx, tx), n| {
            (rx.saturating_add(n.rx_bytes), tx.saturating_add(n.tx_bytes))
        });
    let (block_read, block_write) = block_io_totals(&snapshot);

    Ok(MetricSample {
        workload_id: workload.id.clone(),
        workload_name: workload.name.clone(),
        cpu_percent: cpu_percent(&snapshot.cpu_stats, &snapshot.precpu_stats),
        mem_usage_bytes: mem_usage,
        mem_limit_bytes: mem_limit,
        mem_percent: mem_percent(mem_usage, mem_limit),
        net_rx_bytes: net_rx,
        net_tx_bytes: net_tx,
        block_read_bytes: block_read,
        block_write_bytes: block_write,
        process_count: snapshot.pids_stats.current,
        raw_snapshot: cap_raw_snapshot(serde_json::to_string(raw)?, max_raw_bytes),
        collected_at: snapshot
            .read
            .filter(|read| read.timestamp() > 0)
            .unwrap_or(now),
        ingested_at: None,
    })
}

/// CPU usage between two snapshots as a percentage of one core
///
/// The online count falls back to the per-core array length, then to 1.
pub fn cpu_percent(current: &CpuStats, previous: &CpuStats) -> f64 {
    let cpu_delta =
        current.cpu_usage.total_usage as f64 - previous.cpu_usage.total_usage as f64;
    let system_delta = current.system_cpu_usage as f64 - previous.system_cpu_usage as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }

    let mut online = current.online_cpus;
    if online == 0 {
        online = current.cpu_usage.percpu_usage.len() as u64;
    }
    if online == 0 {
        online = 1;
    }
    (cpu_delta / system_delta) * online as f64 * 100.0
}

pub fn mem_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 / limit as f64 * 100.0
}

fn block_io_totals(snapshot: &ContainerSnapshot) -> (u64, u64) {
    snapshot
        .blkio_stats
        .io_service_bytes_recursive
        .iter()
        .fold((0u64, 0u64), |(read, write), entry| {
            if entry.op.eq_ignore_ascii_case("read") {
                (read.saturating_add(entry.value), write)
            } else if entry.op.eq_ignore_ascii_case("write") {
                (read, write.saturating_add(entry.value))
            } else {
                (read, write)
            }
        })
}

/// Replace an oversized snapshot with a marker recording its size
pub fn cap_raw_snapshot(raw: String, max_bytes: usize) -> String {
    if max_bytes == 0 || raw.len() <= max_bytes {
        return raw;
    }
    serde_json::json!({ "_truncated": true, "original_bytes": raw.len() }).to_string()
}
