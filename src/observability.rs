//! Observability Pipe (C6, spec §4.6).
//!
//! Two independent sinks: in-process metrics (counters/histograms/
//! gauges behind atomics) and append-only structured logs. Built as a
//! constructor-injected collaborator rather than a module-level
//! singleton, per spec §9's explicit re-architecting note.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::ObservabilityConfig;

/// One of the four append-only log streams (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Audit,
    Session,
    Performance,
    Context,
}

impl Stream {
    fn name(&self) -> &'static str {
        match self {
            Stream::Audit => "audit",
            Stream::Session => "session",
            Stream::Performance => "performance",
            Stream::Context => "context",
        }
    }
}

/// One append-only structured log record.
#[derive(Debug, Serialize)]
pub struct LogRecord {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event: String,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(rename = "loopId", skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    #[serde(rename = "iteration", skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    pub payload: serde_json::Value,
}

/// Counters, histograms, and gauges named exactly per spec §4.6.
#[derive(Default)]
pub struct Metrics {
    pub audits_started: AtomicU64,
    pub audits_completed: StdMutex<HashMap<String, u64>>,
    pub audits_failed: StdMutex<HashMap<String, u64>>,
    pub audits_timed_out: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub stagnation_detections: AtomicU64,
    pub contexts_created: AtomicU64,
    pub contexts_terminated: StdMutex<HashMap<String, u64>>,
    pub sessions_created: AtomicU64,
    pub sessions_completed: StdMutex<HashMap<String, u64>>,

    pub audit_duration_ms: StdMutex<Vec<u64>>,
    pub queue_wait_ms: StdMutex<Vec<u64>>,
    pub loops_to_completion: StdMutex<Vec<u32>>,

    pub active_audits: AtomicI64,
    pub queue_depth: AtomicI64,
    pub active_sessions: AtomicI64,
    pub active_contexts: AtomicI64,
}

fn bump(map: &StdMutex<HashMap<String, u64>>, key: &str) {
    let mut guard = map.lock().unwrap();
    *guard.entry(key.to_string()).or_insert(0) += 1;
}

impl Metrics {
    pub fn audit_started(&self) {
        self.audits_started.fetch_add(1, Ordering::Relaxed);
        self.active_audits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audit_completed(&self, verdict: &str, duration_ms: u64) {
        self.active_audits.fetch_sub(1, Ordering::Relaxed);
        bump(&self.audits_completed, verdict);
        self.audit_duration_ms.lock().unwrap().push(duration_ms);
    }

    pub fn audit_failed(&self, category: &str) {
        self.active_audits.fetch_sub(1, Ordering::Relaxed);
        bump(&self.audits_failed, category);
    }

    pub fn audit_timed_out(&self) {
        self.audits_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stagnation_detected(&self) {
        self.stagnation_detections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn context_created(&self) {
        self.contexts_created.fetch_add(1, Ordering::Relaxed);
        self.active_contexts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn context_terminated(&self, reason: &str) {
        self.active_contexts.fetch_sub(1, Ordering::Relaxed);
        bump(&self.contexts_terminated, reason);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_completed(&self, reason: &str, loops: u32) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        bump(&self.sessions_completed, reason);
        self.loops_to_completion.lock().unwrap().push(loops);
    }

    pub fn queue_wait(&self, ms: u64) {
        self.queue_wait_ms.lock().unwrap().push(ms);
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }
}

/// Buffered, background-flushed append-only log writer. Entries are
/// sent over an mpsc channel; a background task drains them on a timer
/// and on shutdown, writing `<logDir>/<stream>-<YYYY-MM-DD>.jsonl` with
/// file-size-based rotation (spec §6).
pub struct ObservabilityPipe {
    metrics: Metrics,
    sender: mpsc::Sender<(Stream, LogRecord)>,
}

struct FlusherState {
    log_dir: PathBuf,
    max_file_bytes: u64,
    retention_files: u32,
}

impl ObservabilityPipe {
    /// Construct the pipe and spawn its background flusher task.
    pub fn start(log_dir: PathBuf, config: &ObservabilityConfig) -> Self {
        let (sender, mut receiver) = mpsc::channel::<(Stream, LogRecord)>(config.buffer_capacity);
        let state = FlusherState {
            log_dir,
            max_file_bytes: config.max_file_bytes,
            retention_files: config.retention_files,
        };
        let flush_interval = std::time::Duration::from_millis(config.flush_interval_ms);

        tokio::spawn(async move {
            let mut buffer: Vec<(Stream, LogRecord)> = Vec::new();
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    maybe_record = receiver.recv() => {
                        match maybe_record {
                            Some(record) => buffer.push(record),
                            None => {
                                flush(&state, &mut buffer).await;
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        flush(&state, &mut buffer).await;
                    }
                }
            }
        });

        Self { metrics: Metrics::default(), sender }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Enqueue a structured log record; never blocks the caller for
    /// long (bounded channel, dropped with a warning if full rather than
    /// stalling a worker — matching spec §5's "no non-trivial blocking"
    /// constraint on the audit path).
    pub fn log(&self, stream: Stream, event: impl Into<String>, payload: serde_json::Value) {
        self.log_with_ids(stream, event, None, None, None, payload);
    }

    pub fn log_with_ids(
        &self,
        stream: Stream,
        event: impl Into<String>,
        session_id: Option<String>,
        loop_id: Option<String>,
        iteration: Option<u32>,
        payload: serde_json::Value,
    ) {
        let record = LogRecord {
            timestamp: chrono::Utc::now(),
            event: event.into(),
            session_id,
            loop_id,
            iteration,
            payload,
        };
        if let Err(e) = self.sender.try_send((stream, record)) {
            warn!(error = %e, "observability log buffer full, dropping record");
        }
    }

    /// Flush on shutdown: close the sender side so the background task
    /// drains and exits, then wait briefly for it to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}

async fn flush(state: &FlusherState, buffer: &mut Vec<(Stream, LogRecord)>) {
    if buffer.is_empty() {
        return;
    }
    if let Err(e) = tokio::fs::create_dir_all(&state.log_dir).await {
        warn!(error = %e, "failed to create log directory");
        buffer.clear();
        return;
    }

    let mut by_stream: HashMap<&'static str, String> = HashMap::new();
    for (stream, record) in buffer.drain(..) {
        let line = match serde_json::to_string(&record) {
            Ok(l) => l,
            Err(_) => continue,
        };
        let entry = by_stream.entry(stream.name()).or_default();
        entry.push_str(&line);
        entry.push('\n');
    }

    for (stream_name, content) in by_stream {
        let date = chrono::Utc::now().format("%Y-%m-%d");
        let path = state.log_dir.join(format!("{stream_name}-{date}.jsonl"));
        rotate_if_needed(&path, state.max_file_bytes, state.retention_files).await;
        if let Ok(mut file) = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
            use tokio::io::AsyncWriteExt;
            let _ = file.write_all(content.as_bytes()).await;
        }
    }
}

async fn rotate_if_needed(path: &std::path::Path, max_bytes: u64, retention: u32) {
    let Ok(metadata) = tokio::fs::metadata(path).await else { return };
    if metadata.len() < max_bytes {
        return;
    }
    for i in (1..retention).rev() {
        let from = path.with_extension(format!("jsonl.{i}"));
        let to = path.with_extension(format!("jsonl.{}", i + 1));
        let _ = tokio::fs::rename(&from, &to).await;
    }
    let rotated = path.with_extension("jsonl.1");
    let _ = tokio::fs::rename(path, &rotated).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_track_active_audits() {
        let m = Metrics::default();
        m.audit_started();
        m.audit_started();
        assert_eq!(m.active_audits.load(Ordering::Relaxed), 2);
        m.audit_completed("pass", 10);
        assert_eq!(m.active_audits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn log_flush_writes_jsonl_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ObservabilityConfig { flush_interval_ms: 20, ..ObservabilityConfig::default() };
        let pipe = ObservabilityPipe::start(dir.path().to_path_buf(), &config);
        pipe.log(Stream::Audit, "audit_started", serde_json::json!({"sessionId": "s1"}));
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        pipe.shutdown().await;

        let mut found = false;
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_name().to_string_lossy().starts_with("audit-") {
                found = true;
            }
        }
        assert!(found, "expected an audit-*.jsonl file to be written");
    }
}
