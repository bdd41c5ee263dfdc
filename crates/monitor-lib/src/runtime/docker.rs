//! Docker engine runtime built on bollard

use super::{async_trait, EventStream, OutputChunk, OutputStream, WorkloadRuntime};
use crate::error::{MonitorError, Result};
use crate::models::{LifecycleEvent, StreamSource, WorkloadDetails, WorkloadRef};
use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogOutput, LogsOptions, StatsOptions,
};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

/// Runtime backed by the local Docker engine API
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the platform default socket
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| MonitorError::Runtime {
            operation: "connect",
            workload_id: None,
            message: e.to_string(),
        })?;
        info!("Connected to Docker engine");
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn display_name(raw: &str) -> String {
    raw.trim_start_matches('/').to_string()
}

#[async_trait]
impl WorkloadRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<WorkloadRef>> {
        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| MonitorError::Runtime {
                operation: "list",
                workload_id: None,
                message: e.to_string(),
            })?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let name = c
                    .names
                    .and_then(|names| names.into_iter().next())
                    .map(|n| display_name(&n))
                    .unwrap_or_default();
                Some(WorkloadRef { id, name })
            })
            .collect())
    }

    async fn inspect(&self, workload_id: &str) -> Result<WorkloadDetails> {
        let details = self
            .docker
            .inspect_container(workload_id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| MonitorError::runtime("inspect", workload_id, e))?;

        Ok(WorkloadDetails {
            name: details.name.as_deref().map(display_name).unwrap_or_default(),
            tty: details.config.and_then(|c| c.tty).unwrap_or(false),
        })
    }

    async fn sample_once(&self, workload_id: &str) -> Result<serde_json::Value> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let stats = self
            .docker
            .stats(workload_id, Some(options))
            .next()
            .await
            .ok_or_else(|| MonitorError::runtime("stats", workload_id, "empty stats response"))?
            .map_err(|e| MonitorError::runtime("stats", workload_id, e))?;

        Ok(serde_json::to_value(&stats)?)
    }

    async fn follow_output(
        &self,
        workload_id: &str,
        since: Option<DateTime<Utc>>,
        tty: bool,
    ) -> Result<OutputStream> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            since: since.map(|t| t.timestamp()).unwrap_or(0),
            ..Default::default()
        };
        debug!(workload_id = %workload_id, tty, "Opening log stream");

        let id = workload_id.to_string();
        let stream = self
            .docker
            .logs(workload_id, Some(options))
            .filter_map(move |item| {
                let mapped = match item {
                    Ok(LogOutput::StdErr { message }) if !tty => {
                        Some(Ok(OutputChunk::new(StreamSource::Stderr, message)))
                    }
                    Ok(LogOutput::StdIn { .. }) => None,
                    Ok(output) => Some(Ok(OutputChunk::new(
                        StreamSource::Stdout,
                        output.into_bytes(),
                    ))),
                    Err(e) => Some(Err(MonitorError::runtime("logs", id.clone(), e))),
                };
                futures::future::ready(mapped)
            });

        Ok(stream.boxed())
    }

    async fn subscribe_events(&self) -> Result<EventStream> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self.docker.events(Some(options)).map(|item| {
            let message = item.map_err(|e| MonitorError::EventStream(e.to_string()))?;
            let id = message.actor.and_then(|a| a.id).unwrap_or_default();
            let action = message.action.unwrap_or_default();
            Ok(LifecycleEvent::new(id, &action))
        });

        Ok(stream.boxed())
    }
}
