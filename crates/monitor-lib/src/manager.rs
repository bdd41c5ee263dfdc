//! Pipeline lifecycle manager
//!
//! Runs the enabled pipelines under one cancellation scope. The first
//! pipeline to fail (other than by cancellation) has its error captured and
//! cancels the scope, which stops every sibling.

use crate::config::MonitorConfig;
use crate::error::{MonitorError, Result};
use crate::health::{components, HealthRegistry};
use crate::logs::LogCollector;
use crate::observability::StructuredLogger;
use crate::retention::RetentionEnforcer;
use crate::stats::StatsSampler;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A long-running unit the manager supervises
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run until `cancel` fires or a fatal error occurs
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

#[async_trait]
impl Pipeline for StatsSampler {
    fn name(&self) -> &'static str {
        components::STATS_SAMPLER
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        StatsSampler::run(self, cancel).await
    }
}

#[async_trait]
impl Pipeline for LogCollector {
    fn name(&self) -> &'static str {
        components::LOG_COLLECTOR
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        LogCollector::run(self, cancel).await
    }
}

#[async_trait]
impl Pipeline for RetentionEnforcer {
    fn name(&self) -> &'static str {
        components::RETENTION
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        RetentionEnforcer::run(self, cancel).await
    }
}

struct Slot {
    kind: &'static str,
    enabled: bool,
    pipeline: Option<Arc<dyn Pipeline>>,
}

/// Starts, stops and waits for the monitoring pipelines
pub struct Manager {
    slots: [Slot; 3],
    health: Option<HealthRegistry>,
    logger: Option<StructuredLogger>,
    started: AtomicBool,
    scope: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    first_error: Arc<Mutex<Option<MonitorError>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Manager {
    /// Enabled flags are read from `config`; pipelines are attached with the builders
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            slots: [
                Slot {
                    kind: "stats",
                    enabled: config.stats.enabled,
                    pipeline: None,
                },
                Slot {
                    kind: "logs",
                    enabled: config.logs.enabled,
                    pipeline: None,
                },
                Slot {
                    kind: "retention",
                    enabled: config.retention.enabled,
                    pipeline: None,
                },
            ],
            health: None,
            logger: None,
            started: AtomicBool::new(false),
            scope: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_stats(self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.with_slot(0, pipeline)
    }

    pub fn with_logs(self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.with_slot(1, pipeline)
    }

    pub fn with_retention(self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.with_slot(2, pipeline)
    }

    fn with_slot(mut self, index: usize, pipeline: Arc<dyn Pipeline>) -> Self {
        self.slots[index].pipeline = Some(pipeline);
        self
    }

    /// Mirror pipeline state into a health registry
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Names of the pipelines `start` will run
    pub fn enabled_pipelines(&self) -> Vec<&'static str> {
        self.slots
            .iter()
            .filter(|slot| slot.enabled)
            .filter_map(|slot| slot.pipeline.as_ref().map(|p| p.name()))
            .collect()
    }

    /// Spawn every enabled pipeline under a child of `parent`. Only the first call succeeds.
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        if let Some(slot) = self
            .slots
            .iter()
            .find(|slot| slot.enabled && slot.pipeline.is_none())
        {
            return Err(MonitorError::MissingPipeline(slot.kind));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MonitorError::AlreadyStarted);
        }

        let scope = parent.child_token();
        *lock(&self.scope) = Some(scope.clone());

        let mut tasks = Vec::new();
        for slot in self.slots.iter().filter(|slot| slot.enabled) {
            let Some(pipeline) = slot.pipeline.clone() else {
                continue;
            };
            let name = pipeline.name();
            if let Some(health) = &self.health {
                health.register(name).await;
            }
            tasks.push((name, tokio::spawn(self.supervise(pipeline, scope.clone()))));
        }
        info!(pipelines = tasks.len(), "Pipelines started");
        *lock(&self.tasks) = tasks;

        if let Some(health) = &self.health {
            health.set_ready(true).await;
        }
        Ok(())
    }

    fn supervise(
        &self,
        pipeline: Arc<dyn Pipeline>,
        scope: CancellationToken,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let health = self.health.clone();
        let logger = self.logger.clone();
        let first_error = Arc::clone(&self.first_error);

        async move {
            let name = pipeline.name();
            match pipeline.run(scope.clone()).await {
                Ok(()) => debug!(pipeline = name, "Pipeline exited"),
                Err(e) if e.is_cancelled() => debug!(pipeline = name, "Pipeline cancelled"),
                Err(e) => {
                    match &logger {
                        Some(logger) => logger.log_pipeline_failed(name, &e),
                        None => error!(pipeline = name, error = %e, "Pipeline failed"),
                    }
                    if let Some(health) = &health {
                        health.set_unhealthy(name, e.to_string()).await;
                    }
                    lock(&first_error).get_or_insert(e);
                    scope.cancel();
                }
            }
        }
    }

    /// Token that fires when the pipelines are stopping, for callers that
    /// want to react to a fatal failure. `None` before `start`.
    pub fn scope(&self) -> Option<CancellationToken> {
        lock(&self.scope).clone()
    }

    /// Cancel every pipeline
    pub fn stop(&self) {
        if let Some(scope) = lock(&self.scope).as_ref() {
            scope.cancel();
        }
    }

    /// Wait for every pipeline to exit and return the first fatal error
    pub async fn wait(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for (name, handle) in tasks {
            if let Err(e) = handle.await {
                let err = MonitorError::from_join(name, e);
                if !err.is_cancelled() {
                    error!(pipeline = name, error = %err, "Pipeline task aborted");
                    if let Some(health) = &self.health {
                        health.set_unhealthy(name, err.to_string()).await;
                    }
                    lock(&self.first_error).get_or_insert(err);
                    self.stop();
                }
            }
        }

        if let Some(health) = &self.health {
            health.set_ready(false).await;
        }
        match lock(&self.first_error).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
