//! Scripted runtime used by the pipeline tests

use super::{async_trait, EventStream, OutputChunk, OutputStream, WorkloadRuntime};
use crate::error::{MonitorError, Result};
use crate::models::{LifecycleEvent, WorkloadDetails, WorkloadRef};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Default)]
pub(crate) struct ScriptedRuntime {
    workloads: Mutex<Vec<WorkloadRef>>,
    snapshots: Mutex<HashMap<String, serde_json::Value>>,
    failing: Mutex<HashSet<String>>,
    tty: Mutex<HashSet<String>>,
    outputs: Mutex<HashMap<String, mpsc::UnboundedReceiver<Result<OutputChunk>>>>,
    sessions: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<LifecycleEvent>>>>,
    inspect_delay: Mutex<Duration>,
    pub samples: AtomicUsize,
    pub follows: AtomicUsize,
    pub subscriptions: AtomicUsize,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workload(&self, id: &str, name: &str) {
        self.workloads.lock().unwrap().push(WorkloadRef {
            id: id.to_string(),
            name: name.to_string(),
        });
    }

    pub fn set_snapshot(&self, id: &str, snapshot: serde_json::Value) {
        self.snapshots
            .lock()
            .unwrap()
            .insert(id.to_string(), snapshot);
    }

    pub fn fail_samples_for(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    pub fn set_tty(&self, id: &str) {
        self.tty.lock().unwrap().insert(id.to_string());
    }

    pub fn set_inspect_delay(&self, delay: Duration) {
        *self.inspect_delay.lock().unwrap() = delay;
    }

    /// Output for `id` that ends after the given chunks
    pub fn push_output(&self, id: &str, chunks: Vec<OutputChunk>) {
        let tx = self.live_output(id);
        for chunk in chunks {
            tx.send(Ok(chunk)).unwrap();
        }
    }

    /// Output for `id` that stays open while the sender is alive
    pub fn live_output(&self, id: &str) -> mpsc::UnboundedSender<Result<OutputChunk>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.outputs.lock().unwrap().insert(id.to_string(), rx);
        tx
    }

    /// Next subscription delivers these events, then ends
    pub fn push_event_session(&self, events: Vec<Result<LifecycleEvent>>) {
        let tx = self.live_event_session();
        for event in events {
            tx.send(event).unwrap();
        }
    }

    /// Next subscription stays open while the sender is alive
    pub fn live_event_session(&self) -> mpsc::UnboundedSender<Result<LifecycleEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap().push_back(rx);
        tx
    }
}

#[async_trait]
impl WorkloadRuntime for ScriptedRuntime {
    async fn list_running(&self) -> Result<Vec<WorkloadRef>> {
        Ok(self.workloads.lock().unwrap().clone())
    }

    async fn inspect(&self, workload_id: &str) -> Result<WorkloadDetails> {
        let delay = *self.inspect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let name = self
            .workloads
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.id == workload_id)
            .map(|w| w.name.clone())
            .unwrap_or_else(|| format!("{workload_id}-name"));
        Ok(WorkloadDetails {
            name,
            tty: self.tty.lock().unwrap().contains(workload_id),
        })
    }

    async fn sample_once(&self, workload_id: &str) -> Result<serde_json::Value> {
        self.samples.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(workload_id) {
            return Err(MonitorError::runtime("stats", workload_id, "no such container"));
        }
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .get(workload_id)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})))
    }

    async fn follow_output(
        &self,
        workload_id: &str,
        _since: Option<DateTime<Utc>>,
        _tty: bool,
    ) -> Result<OutputStream> {
        self.follows.fetch_add(1, Ordering::SeqCst);
        match self.outputs.lock().unwrap().remove(workload_id) {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn subscribe_events(&self) -> Result<EventStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        match self.sessions.lock().unwrap().pop_front() {
            Some(rx) => Ok(UnboundedReceiverStream::new(rx).boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}
