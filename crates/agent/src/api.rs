//! HTTP API: health, Prometheus metrics, stored data queries and manual pruning

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use monitor_lib::{
    ComponentStatus, Entity, HealthRegistry, LogQuery, LogRecord, MetricSample, MonitorError,
    PruneReport, RetentionEnforcer, StatsQuery, Store,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub store: Arc<dyn Store>,
    /// Absent when retention is disabled
    pub retention: Option<Arc<RetentionEnforcer>>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        store: Arc<dyn Store>,
        retention: Option<Arc<RetentionEnforcer>>,
    ) -> Self {
        Self {
            health_registry,
            store,
            retention,
        }
    }
}

/// Error body returned by the data endpoints
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

pub enum ApiError {
    Monitor(MonitorError),
    Unavailable(&'static str),
}

impl From<MonitorError> for ApiError {
    fn from(err: MonitorError) -> Self {
        ApiError::Monitor(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::Monitor(err) => {
                warn!(error = %err, "API request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
            ApiError::Unavailable(reason) => (StatusCode::SERVICE_UNAVAILABLE, reason.to_string()),
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

/// Row counts per entity
#[derive(Debug, Serialize)]
pub struct StorageInfo {
    pub stats: u64,
    pub logs: u64,
}

/// 200 while no component is unhealthy, 503 otherwise
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn list_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Vec<MetricSample>>, ApiError> {
    Ok(Json(state.store.query_metric_samples(&query).await?))
}

async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    Ok(Json(state.store.query_log_records(&query).await?))
}

async fn storage_info(State(state): State<Arc<AppState>>) -> Result<Json<StorageInfo>, ApiError> {
    Ok(Json(StorageInfo {
        stats: state.store.count(Entity::Stats).await?,
        logs: state.store.count(Entity::Logs).await?,
    }))
}

async fn prune(State(state): State<Arc<AppState>>) -> Result<Json<PruneReport>, ApiError> {
    let retention = state
        .retention
        .as_ref()
        .ok_or(ApiError::Unavailable("retention is disabled"))?;
    let report = retention.run_once(chrono::Utc::now()).await?;
    info!(deleted = report.total(), "Manual retention pass complete");
    Ok(Json(report))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/stats", get(list_stats))
        .route("/api/v1/logs", get(list_logs))
        .route("/api/v1/storage", get(storage_info))
        .route("/api/v1/retention/prune", post(prune))
        .with_state(state)
}

/// Bind the API port on all interfaces
pub async fn bind(port: u16) -> anyhow::Result<TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind API address {addr}"))?;
    Ok(listener)
}

/// Serve until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);
    info!(addr = ?listener.local_addr().ok(), "Starting API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
