//! Container monitoring pipelines
//!
//! This crate provides:
//! - A stats sampler that snapshots resource usage of every running workload
//! - A log collector that follows workload output across restarts
//! - A tiered retention enforcer that keeps storage bounded
//! - A manager that runs the three together under shared cancellation
//!
//! Pipelines talk to the container engine through [`WorkloadRuntime`] and to
//! persistence through [`Store`]. Docker and SQLite implementations live
//! behind the `docker` and `sqlite` features.

pub mod batch;
pub mod config;
pub mod error;
pub mod health;
pub mod logs;
pub mod manager;
pub mod models;
pub mod observability;
pub mod retention;
pub mod runtime;
pub mod stats;
pub mod store;

pub use config::{LogConfig, MonitorConfig, RetentionConfig, StatsConfig};
pub use error::{noop_handler, ErrorHandler, MonitorError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use logs::LogCollector;
pub use manager::{Manager, Pipeline};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use retention::{PruneReport, RetentionEnforcer, Tier, TierCounts};
pub use runtime::WorkloadRuntime;
pub use stats::StatsSampler;
pub use store::{LogQuery, MemoryStore, StatsQuery, Store};
