//! Tailer registry and per-workload tailer task

use super::parse::{infer_level, split_timestamped_line};
use super::Reporter;
use crate::error::{MonitorError, Result};
use crate::models::{LogRecord, StreamSource};
use crate::observability::PipelineMetrics;
use crate::runtime::{OutputStream, WorkloadRuntime};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Chunks buffered between the demultiplexer and each line scanner
const SCANNER_BUFFER: usize = 64;

struct TailerEntry {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    next_generation: u64,
    tailers: HashMap<String, TailerEntry>,
}

/// Active tailers keyed by workload id, at most one per id
pub(crate) struct TailerRegistry {
    limit: usize,
    inner: Mutex<RegistryInner>,
}

/// Proof of registration handed to a tailer task
#[derive(Debug)]
pub(crate) struct TailerLease {
    pub workload_id: String,
    pub cancel: CancellationToken,
    generation: u64,
}

impl TailerRegistry {
    /// `limit` of 0 means unbounded
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a tailer for `workload_id`.
    ///
    /// Returns `Ok(None)` when one is already registered and
    /// [`MonitorError::TailerLimit`] when the registry is full.
    pub fn try_acquire(
        &self,
        workload_id: &str,
        parent: &CancellationToken,
    ) -> Result<Option<TailerLease>> {
        let mut inner = self.lock();
        if inner.tailers.contains_key(workload_id) {
            return Ok(None);
        }
        if self.limit > 0 && inner.tailers.len() >= self.limit {
            return Err(MonitorError::TailerLimit { limit: self.limit });
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let cancel = parent.child_token();
        inner.tailers.insert(
            workload_id.to_string(),
            TailerEntry {
                generation,
                cancel: cancel.clone(),
            },
        );
        Ok(Some(TailerLease {
            workload_id: workload_id.to_string(),
            cancel,
            generation,
        }))
    }

    /// Cancel and forget the tailer for `workload_id`, if any
    pub fn stop(&self, workload_id: &str) -> bool {
        match self.lock().tailers.remove(workload_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the lease's entry unless a newer tailer replaced it
    pub fn release(&self, lease: &TailerLease) {
        let mut inner = self.lock();
        let owned = inner
            .tailers
            .get(&lease.workload_id)
            .is_some_and(|entry| entry.generation == lease.generation);
        if owned {
            inner.tailers.remove(&lease.workload_id);
        }
    }

    /// Cancel every tailer; returns how many were active
    pub fn stop_all(&self) -> usize {
        let drained: Vec<TailerEntry> = self.lock().tailers.drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.cancel.cancel();
        }
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.lock().tailers.len()
    }

    pub fn contains(&self, workload_id: &str) -> bool {
        self.lock().tailers.contains_key(workload_id)
    }
}

/// Everything a tailer task needs, cloned into each task
#[derive(Clone)]
pub(crate) struct TailerContext {
    pub runtime: Arc<dyn WorkloadRuntime>,
    pub registry: Arc<TailerRegistry>,
    pub records: mpsc::Sender<LogRecord>,
    pub reporter: Reporter,
    pub metrics: PipelineMetrics,
    pub max_line_bytes: usize,
}

/// Identity stamped on every record of one tailer
struct Origin<'a> {
    workload_id: &'a str,
    workload_name: &'a str,
}

impl TailerContext {
    /// Follow one workload until its output ends or the lease is cancelled
    pub async fn run(self, lease: TailerLease, since: Option<DateTime<Utc>>) {
        let result = self.follow(&lease, since).await;
        self.registry.release(&lease);
        self.metrics.set_active_tailers(self.registry.len());

        match result {
            Err(e) if !e.is_cancelled() => self.reporter.report(&e),
            _ => debug!(workload_id = %lease.workload_id, "Tailer finished"),
        }
    }

    async fn follow(&self, lease: &TailerLease, since: Option<DateTime<Utc>>) -> Result<()> {
        let id = lease.workload_id.as_str();
        let cancel = &lease.cancel;

        let details = tokio::select! {
            _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
            inspected = tokio::time::timeout(INSPECT_TIMEOUT, self.runtime.inspect(id)) => {
                inspected.map_err(|_| MonitorError::runtime("inspect", id, "timed out"))??
            }
        };
        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
            opened = self.runtime.follow_output(id, since, details.tty) => opened?,
        };
        debug!(
            workload_id = %id,
            name = %details.name,
            tty = details.tty,
            "Tailing workload output"
        );

        let origin = Origin {
            workload_id: id,
            workload_name: &details.name,
        };
        let demux = !details.tty;
        let (stdout_tx, stdout_rx) = mpsc::channel(SCANNER_BUFFER);
        let (stderr_tx, stderr_rx) = if demux {
            let (tx, rx) = mpsc::channel(SCANNER_BUFFER);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let pump = self.pump(cancel, id, stream, demux, stdout_tx, stderr_tx);
        let stdout = self.scan(cancel, &origin, StreamSource::Stdout, stdout_rx);
        let stderr = async {
            if let Some(rx) = stderr_rx {
                self.scan(cancel, &origin, StreamSource::Stderr, rx).await;
            }
        };
        let (pumped, _, _) = tokio::join!(pump, stdout, stderr);
        pumped
    }

    /// Route output chunks to the per-source scanners
    async fn pump(
        &self,
        cancel: &CancellationToken,
        id: &str,
        mut stream: OutputStream,
        demux: bool,
        stdout: mpsc::Sender<Bytes>,
        stderr: Option<mpsc::Sender<Bytes>>,
    ) -> Result<()> {
        let mut stdout = Some(stdout);
        let mut stderr = stderr;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(chunk) => chunk?,
                None => return Ok(()),
            };

            let slot = if demux && chunk.source == StreamSource::Stderr {
                &mut stderr
            } else {
                &mut stdout
            };
            if let Some(tx) = slot {
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return Err(MonitorError::Cancelled),
                    sent = tx.send(chunk.bytes) => sent,
                };
                if sent.is_err() {
                    // That scanner stopped; keep feeding the other one.
                    *slot = None;
                }
            }
            if stdout.is_none() && stderr.is_none() {
                debug!(workload_id = %id, "All scanners stopped, closing output stream");
                return Ok(());
            }
        }
    }

    /// Split one source into lines and queue a record per line
    async fn scan(
        &self,
        cancel: &CancellationToken,
        origin: &Origin<'_>,
        source: StreamSource,
        rx: mpsc::Receiver<Bytes>,
    ) {
        let reader = StreamReader::new(ReceiverStream::new(rx).map(Ok::<_, io::Error>));
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), self.max_line_bytes);
        let mut lines = FramedRead::new(reader, codec);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = lines.next() => next,
            };
            match next {
                None => return,
                Some(Ok(line)) => {
                    if !self.emit(origin, source, &line) {
                        return;
                    }
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    self.reporter.report(&MonitorError::LineTooLong {
                        workload_id: origin.workload_id.to_string(),
                        stream: source,
                        limit: self.max_line_bytes,
                    });
                    return;
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => {
                    self.reporter.report(&MonitorError::Scan {
                        workload_id: origin.workload_id.to_string(),
                        stream: source,
                        message: e.to_string(),
                    });
                    return;
                }
            }
        }
    }

    /// Queue one line without blocking. Returns false once the writer is gone.
    fn emit(&self, origin: &Origin<'_>, source: StreamSource, line: &[u8]) -> bool {
        let text = String::from_utf8_lossy(line);
        let text = text.strip_suffix('\r').unwrap_or(&text);
        let (timestamp, message) = split_timestamped_line(text, Utc::now());

        let record = LogRecord {
            workload_id: origin.workload_id.to_string(),
            workload_name: origin.workload_name.to_string(),
            source,
            level: infer_level(message),
            message: message.to_string(),
            raw_line: text.to_string(),
            timestamp,
            ingested_at: None,
        };

        match self.records.try_send(record) {
            Ok(()) => {
                self.metrics.inc_log_records();
                true
            }
            Err(TrySendError::Full(_)) => {
                self.metrics.inc_log_dropped();
                self.reporter.report(&MonitorError::QueueFull {
                    workload_id: origin.workload_id.to_string(),
                });
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorHandler;
    use crate::models::LogLevel;
    use crate::runtime::testing::ScriptedRuntime;
    use crate::runtime::OutputChunk;

    fn collecting_reporter() -> (Reporter, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handler: ErrorHandler = Arc::new(move |e| sink.lock().unwrap().push(e.to_string()));
        (Reporter::new(handler), errors)
    }

    fn context(
        runtime: Arc<ScriptedRuntime>,
        capacity: usize,
        max_line_bytes: usize,
    ) -> (TailerContext, mpsc::Receiver<LogRecord>, Arc<Mutex<Vec<String>>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (reporter, errors) = collecting_reporter();
        let ctx = TailerContext {
            runtime,
            registry: Arc::new(TailerRegistry::new(0)),
            records: tx,
            reporter,
            metrics: PipelineMetrics::new(),
            max_line_bytes,
        };
        (ctx, rx, errors)
    }

    fn drain(rx: &mut mpsc::Receiver<LogRecord>) -> Vec<LogRecord> {
        let mut out = Vec::new();
        while let Ok(record) = rx.try_recv() {
            out.push(record);
        }
        out
    }

    #[test]
    fn test_registry_rejects_duplicates_and_overflow() {
        let registry = TailerRegistry::new(2);
        let parent = CancellationToken::new();

        assert!(registry.try_acquire("a", &parent).unwrap().is_some());
        assert!(registry.try_acquire("a", &parent).unwrap().is_none());
        assert!(registry.try_acquire("b", &parent).unwrap().is_some());
        let err = registry.try_acquire("c", &parent).unwrap_err();
        assert!(matches!(err, MonitorError::TailerLimit { limit: 2 }));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stale_release_keeps_replacement() {
        let registry = TailerRegistry::new(0);
        let parent = CancellationToken::new();

        let first = registry.try_acquire("a", &parent).unwrap().unwrap();
        assert!(registry.stop("a"));
        assert!(first.cancel.is_cancelled());

        let second = registry.try_acquire("a", &parent).unwrap().unwrap();
        registry.release(&first);
        assert!(registry.contains("a"));
        assert!(!second.cancel.is_cancelled());

        registry.release(&second);
        assert!(!registry.contains("a"));
    }

    #[test]
    fn test_stop_all_cancels_everything() {
        let registry = TailerRegistry::new(0);
        let parent = CancellationToken::new();
        let a = registry.try_acquire("a", &parent).unwrap().unwrap();
        let b = registry.try_acquire("b", &parent).unwrap().unwrap();

        assert_eq!(registry.stop_all(), 2);
        assert!(a.cancel.is_cancelled() && b.cancel.is_cancelled());
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_demux_routes_sources_and_reassembles_lines() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.add_workload("abc", "web");
        runtime.push_output(
            "abc",
            vec![
                OutputChunk::new(StreamSource::Stdout, "2024-03-01T12:00:00Z info: sta"),
                OutputChunk::new(StreamSource::Stderr, "2024-03-01T12:00:01Z error: boom\n"),
                OutputChunk::new(StreamSource::Stdout, "rted\r\nno timestamp here\n"),
            ],
        );
        let (ctx, mut rx, errors) = context(runtime, 16, 1024);
        let lease = ctx
            .registry
            .try_acquire("abc", &CancellationToken::new())
            .unwrap()
            .unwrap();
        let registry = Arc::clone(&ctx.registry);

        ctx.run(lease, None).await;

        let records = drain(&mut rx);
        assert_eq!(records.len(), 3);
        let stdout: Vec<_> = records
            .iter()
            .filter(|r| r.source == StreamSource::Stdout)
            .collect();
        assert_eq!(stdout[0].message, "info: started");
        assert_eq!(stdout[0].level, Some(LogLevel::Info));
        assert_eq!(stdout[0].workload_name, "web");
        assert_eq!(stdout[1].message, "no timestamp here");
        assert_eq!(stdout[1].level, None);

        let stderr: Vec<_> = records
            .iter()
            .filter(|r| r.source == StreamSource::Stderr)
            .collect();
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].level, Some(LogLevel::Error));
        assert_eq!(stderr[0].raw_line, "2024-03-01T12:00:01Z error: boom");

        assert!(errors.lock().unwrap().is_empty());
        assert!(!registry.contains("abc"));
    }

    #[tokio::test]
    async fn test_tty_output_is_single_stdout_stream() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.set_tty("tty1");
        runtime.push_output(
            "tty1",
            vec![OutputChunk::new(StreamSource::Stdout, "line one\nline two\n")],
        );
        let (ctx, mut rx, _) = context(runtime, 16, 1024);
        let lease = ctx
            .registry
            .try_acquire("tty1", &CancellationToken::new())
            .unwrap()
            .unwrap();

        ctx.run(lease, None).await;

        let records = drain(&mut rx);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.source == StreamSource::Stdout));
    }

    #[tokio::test]
    async fn test_long_line_stops_only_that_scanner() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let long = format!("{}\n", "x".repeat(64));
        runtime.push_output(
            "abc",
            vec![
                OutputChunk::new(StreamSource::Stdout, long),
                OutputChunk::new(StreamSource::Stderr, "short\n"),
            ],
        );
        let (ctx, mut rx, errors) = context(runtime, 16, 16);
        let lease = ctx
            .registry
            .try_acquire("abc", &CancellationToken::new())
            .unwrap()
            .unwrap();

        ctx.run(lease, None).await;

        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].source, StreamSource::Stderr);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("line exceeds 16 bytes"));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_reports() {
        let runtime = Arc::new(ScriptedRuntime::new());
        let (ctx, mut rx, errors) = context(runtime, 1, 1024);
        let origin = Origin {
            workload_id: "abc",
            workload_name: "web",
        };

        assert!(ctx.emit(&origin, StreamSource::Stdout, b"first"));
        assert!(ctx.emit(&origin, StreamSource::Stdout, b"second"));

        let records = drain(&mut rx);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "first");
        assert_eq!(
            *errors.lock().unwrap(),
            vec!["log queue full, dropped line from abc".to_string()]
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_attach_emits_nothing() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.set_inspect_delay(Duration::from_millis(200));
        runtime.push_output(
            "abc",
            vec![OutputChunk::new(StreamSource::Stdout, "hello\n")],
        );
        let (ctx, mut rx, errors) = context(Arc::clone(&runtime), 16, 1024);
        let lease = ctx
            .registry
            .try_acquire("abc", &CancellationToken::new())
            .unwrap()
            .unwrap();
        lease.cancel.cancel();

        ctx.run(lease, None).await;

        assert!(drain(&mut rx).is_empty());
        assert!(errors.lock().unwrap().is_empty());
        assert_eq!(
            runtime.follows.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }
}
