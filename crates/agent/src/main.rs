//! Container monitor daemon
//!
//! Samples resource usage and follows the output of every container on the
//! host, keeps both in SQLite under a tiered retention policy, and serves
//! health, metrics and query endpoints.

use anyhow::{Context, Result};
use container_monitor::{api, config::AgentConfig};
use monitor_lib::{
    runtime::DockerRuntime, store::SqliteStore, HealthRegistry, LogCollector, Manager,
    RetentionEnforcer, StatsSampler, Store, StructuredLogger, WorkloadRuntime,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load()?;

    // JSON output; RUST_LOG overrides the configured level
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(fmt::layer().json())
        .init();

    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    let logger = StructuredLogger::new(host);

    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::open(&config.storage.path)
            .await
            .with_context(|| format!("failed to open {}", config.storage.path.display()))?,
    );
    let runtime: Arc<dyn WorkloadRuntime> =
        Arc::new(DockerRuntime::connect().context("failed to connect to Docker")?);

    let monitor = &config.monitor;
    let health = HealthRegistry::new();
    let stats = StatsSampler::new(runtime.clone(), store.clone(), monitor.stats.clone());
    let logs = LogCollector::new(runtime.clone(), store.clone(), monitor.logs.clone())
        .with_health(health.clone());
    let retention = Arc::new(RetentionEnforcer::new(
        store.clone(),
        monitor.retention.clone(),
    )?);

    let manager = Manager::new(monitor)
        .with_stats(Arc::new(stats))
        .with_logs(Arc::new(logs))
        .with_retention(retention.clone())
        .with_health(health.clone())
        .with_logger(logger.clone());
    logger.log_startup(MONITOR_VERSION, &manager.enabled_pipelines());

    let root = CancellationToken::new();
    let listener = api::bind(config.api_port).await?;
    let state = Arc::new(api::AppState::new(
        health,
        store,
        monitor.retention.enabled.then_some(retention),
    ));
    let api_handle = tokio::spawn(api::serve(listener, state, root.clone()));

    manager.start(&root).await?;
    let pipelines = manager.scope().unwrap_or_else(|| root.clone());

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            "SIGINT received"
        }
        _ = pipelines.cancelled() => "pipeline failed",
    };
    logger.log_shutdown(reason);

    manager.stop();
    let result = manager.wait().await;
    root.cancel();
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %e, "API server failed"),
        Err(e) => warn!(error = %e, "API server task aborted"),
        Ok(Ok(())) => {}
    }

    result.context("monitoring pipelines stopped with an error")?;
    info!("Shutdown complete");
    Ok(())
}
