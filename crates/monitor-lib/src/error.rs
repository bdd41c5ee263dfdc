//! Error types for the monitoring pipelines
//!
//! Errors fall into three groups:
//! - per-item and infrastructure failures, reported through an [`ErrorHandler`]
//!   while the pipeline keeps running
//! - fatal failures (storage writes), returned from a pipeline's `run`
//! - cancellation, which is never treated as a failure

use crate::models::StreamSource;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Errors produced by the monitoring pipelines and their collaborators
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("runtime {operation} failed{}: {message}", workload_suffix(.workload_id))]
    Runtime {
        operation: &'static str,
        workload_id: Option<String>,
        message: String,
    },

    #[error("lifecycle event stream: {0}")]
    EventStream(String),

    #[error("storage {operation} failed: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    #[error("log queue full, dropped line from {workload_id}")]
    QueueFull { workload_id: String },

    #[error("tailer limit reached: {limit}")]
    TailerLimit { limit: usize },

    #[error("scan logs ({workload_id}/{stream}): line exceeds {limit} bytes")]
    LineTooLong {
        workload_id: String,
        stream: StreamSource,
        limit: usize,
    },

    #[error("scan logs ({workload_id}/{stream}): {message}")]
    Scan {
        workload_id: String,
        stream: StreamSource,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("manager already started")]
    AlreadyStarted,

    #[error("{0} pipeline is enabled but was not provided")]
    MissingPipeline(&'static str),

    #[error("{name} task panicked: {message}")]
    TaskPanicked { name: &'static str, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

fn workload_suffix(workload_id: &Option<String>) -> String {
    match workload_id {
        Some(id) => format!(" for {id}"),
        None => String::new(),
    }
}

impl MonitorError {
    /// Build a runtime error scoped to a single workload
    pub fn runtime(
        operation: &'static str,
        workload_id: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        MonitorError::Runtime {
            operation,
            workload_id: Some(workload_id.into()),
            message: message.to_string(),
        }
    }

    /// Build a storage error
    pub fn storage(operation: &'static str, message: impl ToString) -> Self {
        MonitorError::Storage {
            operation,
            message: message.to_string(),
        }
    }

    /// Returns true if this error only signals cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, MonitorError::Cancelled)
    }

    /// Convert a join failure of a supervised task into an error
    pub(crate) fn from_join(name: &'static str, err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            return MonitorError::Cancelled;
        }
        MonitorError::TaskPanicked {
            name,
            message: err.to_string(),
        }
    }
}

/// Callback receiving non-fatal pipeline errors
pub type ErrorHandler = Arc<dyn Fn(&MonitorError) + Send + Sync>;

/// Handler that drops every error
pub fn noop_handler() -> ErrorHandler {
    Arc::new(|_| {})
}
