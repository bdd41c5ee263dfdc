//! Observability infrastructure for the monitoring pipelines
//!
//! Provides:
//! - Prometheus metrics (samples, log throughput, drops, tailers, flush latency, retention)
//! - Structured lifecycle logging with tracing

use crate::models::Entity;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info};

/// Histogram buckets for storage writes (in seconds)
const FLUSH_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
];

/// Histogram buckets for retention passes (in seconds)
const PASS_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    samples_collected: IntCounter,
    sample_failures: IntCounter,
    log_records_collected: IntCounter,
    log_records_dropped: IntCounter,
    active_tailers: IntGauge,
    event_reconnects: IntCounter,
    rows_flushed: IntCounterVec,
    flush_latency_seconds: HistogramVec,
    rows_deleted: IntCounterVec,
    retention_pass_seconds: Histogram,
    pipeline_errors: IntCounterVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            samples_collected: register_int_counter!(
                "container_monitor_samples_collected_total",
                "Resource samples fetched from the runtime"
            )
            .expect("Failed to register samples_collected"),

            sample_failures: register_int_counter!(
                "container_monitor_sample_failures_total",
                "Resource sample fetches that failed and were skipped"
            )
            .expect("Failed to register sample_failures"),

            log_records_collected: register_int_counter!(
                "container_monitor_log_records_collected_total",
                "Log lines queued for storage"
            )
            .expect("Failed to register log_records_collected"),

            log_records_dropped: register_int_counter!(
                "container_monitor_log_records_dropped_total",
                "Log lines dropped because the write queue was full"
            )
            .expect("Failed to register log_records_dropped"),

            active_tailers: register_int_gauge!(
                "container_monitor_active_tailers",
                "Workloads whose output is currently being followed"
            )
            .expect("Failed to register active_tailers"),

            event_reconnects: register_int_counter!(
                "container_monitor_event_reconnects_total",
                "Lifecycle event stream resubscriptions"
            )
            .expect("Failed to register event_reconnects"),

            rows_flushed: register_int_counter_vec!(
                "container_monitor_rows_flushed_total",
                "Rows written to storage by the batch writers",
                &["entity"]
            )
            .expect("Failed to register rows_flushed"),

            flush_latency_seconds: register_histogram_vec!(
                "container_monitor_flush_latency_seconds",
                "Time spent writing one batch to storage",
                &["entity"],
                FLUSH_BUCKETS.to_vec()
            )
            .expect("Failed to register flush_latency_seconds"),

            rows_deleted: register_int_counter_vec!(
                "container_monitor_retention_rows_deleted_total",
                "Rows removed by retention enforcement",
                &["entity", "tier"]
            )
            .expect("Failed to register rows_deleted"),

            retention_pass_seconds: register_histogram!(
                "container_monitor_retention_pass_seconds",
                "Duration of one retention enforcement pass",
                PASS_BUCKETS.to_vec()
            )
            .expect("Failed to register retention_pass_seconds"),

            pipeline_errors: register_int_counter_vec!(
                "container_monitor_pipeline_errors_total",
                "Errors reported by each pipeline",
                &["pipeline"]
            )
            .expect("Failed to register pipeline_errors"),
        }
    }
}

/// Pipeline metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn inc_samples_collected(&self) {
        self.inner().samples_collected.inc();
    }

    pub fn inc_sample_failures(&self) {
        self.inner().sample_failures.inc();
    }

    pub fn inc_log_records(&self) {
        self.inner().log_records_collected.inc();
    }

    pub fn inc_log_dropped(&self) {
        self.inner().log_records_dropped.inc();
    }

    pub fn set_active_tailers(&self, count: usize) {
        self.inner().active_tailers.set(count as i64);
    }

    pub fn inc_event_reconnects(&self) {
        self.inner().event_reconnects.inc();
    }

    /// Record one committed batch
    pub fn observe_flush(&self, entity: Entity, rows: usize, duration_secs: f64) {
        let inner = self.inner();
        inner
            .rows_flushed
            .with_label_values(&[entity.as_str()])
            .inc_by(rows as u64);
        inner
            .flush_latency_seconds
            .with_label_values(&[entity.as_str()])
            .observe(duration_secs);
    }

    pub fn add_rows_deleted(&self, entity: Entity, tier: &str, rows: u64) {
        self.inner()
            .rows_deleted
            .with_label_values(&[entity.as_str(), tier])
            .inc_by(rows);
    }

    pub fn observe_retention_pass(&self, duration_secs: f64) {
        self.inner().retention_pass_seconds.observe(duration_secs);
    }

    pub fn inc_pipeline_errors(&self, pipeline: &str) {
        self.inner()
            .pipeline_errors
            .with_label_values(&[pipeline])
            .inc();
    }
}

/// Structured logger for daemon lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    host_name: String,
}

impl StructuredLogger {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }

    /// Log daemon startup with the pipelines that will run
    pub fn log_startup(&self, version: &str, pipelines: &[&str]) {
        info!(
            event = "monitor_started",
            host = %self.host_name,
            version = %version,
            pipelines = ?pipelines,
            "Container monitor started"
        );
    }

    /// Log daemon shutdown
    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "monitor_shutdown",
            host = %self.host_name,
            reason = %reason,
            "Container monitor shutting down"
        );
    }

    /// Log a fatal pipeline failure
    pub fn log_pipeline_failed(&self, pipeline: &str, err: &dyn std::error::Error) {
        error!(
            event = "pipeline_failed",
            host = %self.host_name,
            pipeline = %pipeline,
            error = %err,
            "Pipeline stopped with a fatal error"
        );
    }
}
