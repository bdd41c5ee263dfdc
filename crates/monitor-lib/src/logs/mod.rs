//! Log collector
//!
//! Keeps at most one tailer per running workload. Tailers are started for
//! everything running when the collector starts and for every later `start`
//! lifecycle event, and are cancelled on `die`, `stop` or `destroy`. Lines are
//! queued without blocking; when the queue is full the line is dropped and
//! reported. The event subscription is re-established with jittered backoff.

mod parse;
mod tailer;

pub use parse::{infer_level, split_timestamped_line, with_jitter};

use crate::batch::{BatchPolicy, BatchWriter};
use crate::config::LogConfig;
use crate::error::{noop_handler, ErrorHandler, MonitorError, Result};
use crate::health::{components, HealthRegistry};
use crate::models::{LifecycleAction, LifecycleEvent, LogRecord};
use crate::observability::PipelineMetrics;
use crate::runtime::WorkloadRuntime;
use crate::store::Store;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use tailer::{TailerContext, TailerRegistry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Tailers started from a `start` event look this far before pipeline start
const START_EVENT_LOOKBACK_MS: i64 = 500;

/// Shared error path for the collector and its tailers
#[derive(Clone)]
pub(crate) struct Reporter {
    on_error: ErrorHandler,
    metrics: PipelineMetrics,
}

impl Reporter {
    pub fn new(on_error: ErrorHandler) -> Self {
        Self {
            on_error,
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn report(&self, err: &MonitorError) {
        self.metrics.inc_pipeline_errors("logs");
        match err {
            MonitorError::QueueFull { .. } => debug!(error = %err, "Log line dropped"),
            _ => warn!(error = %err, "Log collector error"),
        }
        (self.on_error)(err);
    }
}

/// Follows the output of every running workload into storage
pub struct LogCollector {
    runtime: Arc<dyn WorkloadRuntime>,
    store: Arc<dyn Store>,
    config: LogConfig,
    on_error: ErrorHandler,
    metrics: PipelineMetrics,
    registry: Arc<TailerRegistry>,
    health: Option<HealthRegistry>,
}

impl LogCollector {
    pub fn new(
        runtime: Arc<dyn WorkloadRuntime>,
        store: Arc<dyn Store>,
        config: LogConfig,
    ) -> Self {
        let config = config.with_defaults();
        Self {
            runtime,
            store,
            registry: Arc::new(TailerRegistry::new(config.tailer_limit)),
            config,
            on_error: noop_handler(),
            metrics: PipelineMetrics::new(),
            health: None,
        }
    }

    /// Report event stream outages as degraded health
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Receive dropped lines, scan failures and event stream losses
    pub fn with_error_handler(mut self, handler: ErrorHandler) -> Self {
        self.on_error = handler;
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Number of workloads currently being followed
    pub fn active_tailers(&self) -> usize {
        self.registry.len()
    }

    /// Collect until `cancel` fires or a storage write fails
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let scope = cancel.child_token();
        let reporter = Reporter::new(Arc::clone(&self.on_error));
        let (record_tx, record_rx) = mpsc::channel::<LogRecord>(self.config.queue_size);

        info!(
            queue_size = self.config.queue_size,
            batch_size = self.config.batch_size,
            tailer_limit = self.config.tailer_limit,
            "Starting log collector"
        );

        let writer = BatchWriter::<LogRecord>::new(
            Arc::clone(&self.store),
            BatchPolicy {
                batch_size: self.config.batch_size,
                flush_interval: self.config.flush_interval,
            },
        );
        let writer_scope = scope.clone();
        let writer_task = tokio::spawn(async move {
            let result = writer.run(record_rx).await;
            if result.is_err() {
                writer_scope.cancel();
            }
            result
        });

        let tracker = TaskTracker::new();
        let ctx = TailerContext {
            runtime: Arc::clone(&self.runtime),
            registry: Arc::clone(&self.registry),
            records: record_tx,
            reporter,
            metrics: self.metrics.clone(),
            max_line_bytes: self.config.max_line_bytes,
        };
        let started_at = self.config.since_from_pipeline_start.then(Utc::now);

        self.reconcile(&ctx, &tracker, &scope, started_at).await;
        self.watch_events(&ctx, &tracker, &scope, started_at).await;

        let stopped = self.registry.stop_all();
        debug!(tailers = stopped, "Log collector stopping, waiting for tailers");
        tracker.close();
        tracker.wait().await;
        self.metrics.set_active_tailers(0);

        // Last sender; the writer drains and exits once it is gone.
        drop(ctx);
        writer_task
            .await
            .map_err(|e| MonitorError::from_join("log writer", e))??;
        info!("Log collector stopped");
        Ok(())
    }

    async fn reconcile(
        &self,
        ctx: &TailerContext,
        tracker: &TaskTracker,
        scope: &CancellationToken,
        since: Option<DateTime<Utc>>,
    ) {
        let listed = tokio::select! {
            _ = scope.cancelled() => return,
            listed = self.runtime.list_running() => listed,
        };
        match listed {
            Ok(workloads) => {
                debug!(workloads = workloads.len(), "Reconciling running workloads");
                for workload in workloads {
                    self.start_tailer(ctx, tracker, scope, &workload.id, since);
                }
            }
            Err(e) => ctx.reporter.report(&e),
        }
    }

    async fn watch_events(
        &self,
        ctx: &TailerContext,
        tracker: &TaskTracker,
        scope: &CancellationToken,
        started_at: Option<DateTime<Utc>>,
    ) {
        let mut stream_lost = false;
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = scope.cancelled() => return,
                subscribed = self.runtime.subscribe_events() => subscribed,
            };

            match subscribed {
                Ok(mut events) => {
                    debug!("Subscribed to lifecycle events");
                    if stream_lost {
                        stream_lost = false;
                        if let Some(health) = &self.health {
                            health.set_healthy(components::LOG_COLLECTOR).await;
                        }
                    }
                    let lost = loop {
                        let next = tokio::select! {
                            biased;
                            _ = scope.cancelled() => return,
                            next = events.next() => next,
                        };
                        match next {
                            Some(Ok(event)) => {
                                self.handle_event(ctx, tracker, scope, event, started_at)
                            }
                            Some(Err(e)) => break e,
                            None => break MonitorError::EventStream("stream closed".into()),
                        }
                    };
                    self.mark_degraded(&lost).await;
                    ctx.reporter.report(&lost);
                }
                Err(e) => {
                    self.mark_degraded(&e).await;
                    ctx.reporter.report(&e);
                }
            }
            stream_lost = true;

            self.metrics.inc_event_reconnects();
            let delay = with_jitter(self.config.reconnect_delay, self.config.reconnect_jitter);
            debug!(delay_ms = delay.as_millis() as u64, "Resubscribing to lifecycle events");
            tokio::select! {
                _ = scope.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn mark_degraded(&self, err: &MonitorError) {
        if let Some(health) = &self.health {
            health
                .set_degraded(components::LOG_COLLECTOR, format!("event stream lost: {err}"))
                .await;
        }
    }

    fn handle_event(
        &self,
        ctx: &TailerContext,
        tracker: &TaskTracker,
        scope: &CancellationToken,
        event: LifecycleEvent,
        started_at: Option<DateTime<Utc>>,
    ) {
        if event.workload_id.is_empty() {
            return;
        }
        match event.action {
            LifecycleAction::Start => {
                let lookback = chrono::Duration::milliseconds(START_EVENT_LOOKBACK_MS);
                let since = started_at.map(|at| at - lookback);
                self.start_tailer(ctx, tracker, scope, &event.workload_id, since);
            }
            action if action.ends_output() => {
                if self.registry.stop(&event.workload_id) {
                    debug!(workload_id = %event.workload_id, ?action, "Stopped tailer");
                }
                self.metrics.set_active_tailers(self.registry.len());
            }
            _ => {}
        }
    }

    fn start_tailer(
        &self,
        ctx: &TailerContext,
        tracker: &TaskTracker,
        scope: &CancellationToken,
        workload_id: &str,
        since: Option<DateTime<Utc>>,
    ) {
        match self.registry.try_acquire(workload_id, scope) {
            Ok(Some(lease)) => {
                self.metrics.set_active_tailers(self.registry.len());
                tracker.spawn(ctx.clone().run(lease, since));
            }
            Ok(None) => debug!(workload_id = %workload_id, "Already tailing"),
            Err(e) => ctx.reporter.report(&e),
        }
    }
}
