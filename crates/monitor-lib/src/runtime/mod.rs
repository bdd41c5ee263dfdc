//! Workload runtime abstraction
//!
//! The pipelines only talk to the container engine through [`WorkloadRuntime`].
//! The caller constructs one runtime and hands an `Arc` of it to every pipeline.
//! A Docker engine implementation is available behind the `docker` feature.

#[cfg(feature = "docker")]
mod docker;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "docker")]
pub use docker::DockerRuntime;

use crate::error::Result;
use crate::models::{LifecycleEvent, StreamSource, WorkloadDetails, WorkloadRef};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

pub use async_trait::async_trait;

/// A piece of workload output tagged with the stream it came from
#[derive(Debug, Clone, PartialEq)]
pub struct OutputChunk {
    pub source: StreamSource,
    pub bytes: Bytes,
}

impl OutputChunk {
    pub fn new(source: StreamSource, bytes: impl Into<Bytes>) -> Self {
        Self {
            source,
            bytes: bytes.into(),
        }
    }
}

/// Follow-mode output of one workload; ends when the workload stops
pub type OutputStream = BoxStream<'static, Result<OutputChunk>>;

/// Container lifecycle events; an `Err` item or the end of the stream means
/// the subscription was lost
pub type EventStream = BoxStream<'static, Result<LifecycleEvent>>;

/// Operations the pipelines need from a container engine
#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// List currently running workloads
    async fn list_running(&self) -> Result<Vec<WorkloadRef>>;

    /// Inspect a workload's display name and output mode
    async fn inspect(&self, workload_id: &str) -> Result<WorkloadDetails>;

    /// Fetch one resource snapshot in the Docker stats JSON layout
    async fn sample_once(&self, workload_id: &str) -> Result<serde_json::Value>;

    /// Follow output with timestamps, starting at `since` when given.
    /// With `tty` set all chunks are reported as stdout.
    async fn follow_output(
        &self,
        workload_id: &str,
        since: Option<DateTime<Utc>>,
        tty: bool,
    ) -> Result<OutputStream>;

    /// Subscribe to container lifecycle events
    async fn subscribe_events(&self) -> Result<EventStream>;
}
