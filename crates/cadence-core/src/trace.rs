// Tracer events
//
// The core emits structured events against a narrow sink interface. Sinks
// are pluggable; the dispatcher buffers on a bounded channel and drops (with
// a counter) instead of blocking the execution path on sink back-pressure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::run_id::RunId;

/// Severity of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured event from the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    pub level: TraceLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Per-event correlation id
    pub cut_id: Uuid,
    pub workflow: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
}

/// Destination for trace events. Implementations must tolerate concurrent
/// emit calls.
#[async_trait]
pub trait TraceSink: Send + Sync {
    async fn emit(&self, event: &TraceEvent) -> Result<()>;
}

/// Sink that forwards to the process logger.
pub struct ConsoleSink;

#[async_trait]
impl TraceSink for ConsoleSink {
    async fn emit(&self, event: &TraceEvent) -> Result<()> {
        match event.level {
            TraceLevel::Debug => tracing::debug!(
                run_id = %event.run_id,
                workflow = %event.workflow,
                job = event.job.as_deref(),
                stage = event.stage.as_deref(),
                "{}",
                event.message
            ),
            TraceLevel::Info => tracing::info!(
                run_id = %event.run_id,
                workflow = %event.workflow,
                job = event.job.as_deref(),
                stage = event.stage.as_deref(),
                "{}",
                event.message
            ),
            TraceLevel::Warn => tracing::warn!(
                run_id = %event.run_id,
                workflow = %event.workflow,
                job = event.job.as_deref(),
                stage = event.stage.as_deref(),
                "{}",
                event.message
            ),
            TraceLevel::Error => tracing::error!(
                run_id = %event.run_id,
                workflow = %event.workflow,
                job = event.job.as_deref(),
                stage = event.stage.as_deref(),
                exception = event.exception.as_deref(),
                "{}",
                event.message
            ),
        }
        Ok(())
    }
}

/// Sink that appends JSON lines under `<dir>/<run_id>.jsonl`.
pub struct FileSink {
    dir: PathBuf,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl TraceSink for FileSink {
    async fn emit(&self, event: &TraceEvent) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| anyhow::anyhow!("trace dir: {e}"))?;
        let path = self.dir.join(format!("{}.jsonl", event.run_id));
        let mut line = serde_json::to_vec(event).map_err(|e| anyhow::anyhow!("trace json: {e}"))?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| anyhow::anyhow!("trace file {path:?}: {e}"))?;
        file.write_all(&line)
            .await
            .map_err(|e| anyhow::anyhow!("trace write: {e}"))?;
        Ok(())
    }
}

/// Bounded buffer between the execution path and the sinks.
const TRACE_BUFFER: usize = 1024;

/// Owns the sinks and the drain task; hands out Tracer handles.
#[derive(Clone)]
pub struct TraceHub {
    tx: Option<mpsc::Sender<TraceEvent>>,
    dropped: Arc<AtomicU64>,
}

impl TraceHub {
    /// Hub over an explicit sink list. An empty list disables tracing.
    pub fn new(sinks: Vec<Arc<dyn TraceSink>>) -> Self {
        if sinks.is_empty() {
            return Self { tx: None, dropped: Arc::new(AtomicU64::new(0)) };
        }
        let (tx, mut rx) = mpsc::channel::<TraceEvent>(TRACE_BUFFER);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sink in &sinks {
                    if let Err(err) = sink.emit(&event).await {
                        tracing::warn!(error = %err, "trace sink emit failed");
                    }
                }
            }
        });
        Self { tx: Some(tx), dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Select sinks from the configuration.
    pub fn from_config(config: &Config) -> Self {
        if !config.trace_enabled {
            return Self::new(Vec::new());
        }
        let sink: Arc<dyn TraceSink> = match config.trace_url.strip_prefix("file://") {
            Some(dir) => Arc::new(FileSink::new(dir)),
            None => Arc::new(ConsoleSink),
        };
        Self::new(vec![sink])
    }

    /// Events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// A tracer scoped to one release.
    pub fn tracer(
        &self,
        run_id: &RunId,
        parent_run_id: Option<&RunId>,
        workflow: &str,
    ) -> Tracer {
        Tracer {
            hub: self.clone(),
            run_id: run_id.to_string(),
            parent_run_id: parent_run_id.map(|id| id.to_string()),
            workflow: workflow.to_string(),
            job: None,
            stage: None,
        }
    }
}

/// Cheap cloneable handle that stamps scope fields onto emitted events.
#[derive(Clone)]
pub struct Tracer {
    hub: TraceHub,
    run_id: String,
    parent_run_id: Option<String>,
    workflow: String,
    job: Option<String>,
    stage: Option<String>,
}

impl Tracer {
    /// Derived handle scoped to a job.
    pub fn with_job(&self, job: &str) -> Tracer {
        let mut t = self.clone();
        t.job = Some(job.to_string());
        t.stage = None;
        t
    }

    /// Derived handle scoped to a stage.
    pub fn with_stage(&self, stage: &str) -> Tracer {
        let mut t = self.clone();
        t.stage = Some(stage.to_string());
        t
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn send(&self, level: TraceLevel, message: String, duration_ms: Option<u64>, exception: Option<String>) {
        let Some(tx) = &self.hub.tx else { return };
        let event = TraceEvent {
            run_id: self.run_id.clone(),
            parent_run_id: self.parent_run_id.clone(),
            level,
            message,
            timestamp: Utc::now(),
            cut_id: Uuid::now_v7(),
            workflow: self.workflow.clone(),
            job: self.job.clone(),
            stage: self.stage.clone(),
            duration_ms,
            exception,
        };
        if tx.try_send(event).is_err() {
            self.hub.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.send(TraceLevel::Debug, message.into(), None, None);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(TraceLevel::Info, message.into(), None, None);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.send(TraceLevel::Warn, message.into(), None, None);
    }

    pub fn error(&self, message: impl Into<String>, exception: Option<String>) {
        self.send(TraceLevel::Error, message.into(), None, exception);
    }

    /// Completion event carrying a duration.
    pub fn done(&self, message: impl Into<String>, duration_ms: u64) {
        self.send(TraceLevel::Info, message.into(), Some(duration_ms), None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    struct Capture {
        events: Arc<Mutex<Vec<TraceEvent>>>,
    }

    #[async_trait]
    impl TraceSink for Capture {
        async fn emit(&self, event: &TraceEvent) -> Result<()> {
            self.events.lock().await.push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn events_carry_scope_fields() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let hub = TraceHub::new(vec![Arc::new(Capture { events: events.clone() })]);
        let run_id = RunId::generate("wf");
        let tracer = hub.tracer(&run_id, None, "wf").with_job("extract").with_stage("pull");
        tracer.info("stage started");
        tracer.done("stage finished", 12);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let seen = events.lock().await;
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].job.as_deref(), Some("extract"));
        assert_eq!(seen[0].stage.as_deref(), Some("pull"));
        assert_eq!(seen[1].duration_ms, Some(12));
        assert_eq!(seen[0].workflow, "wf");
    }

    #[tokio::test]
    async fn disabled_hub_drops_everything_quietly() {
        let hub = TraceHub::new(Vec::new());
        let run_id = RunId::generate("wf");
        let tracer = hub.tracer(&run_id, None, "wf");
        tracer.info("goes nowhere");
        assert_eq!(hub.dropped(), 0);
    }

    #[tokio::test]
    async fn file_sink_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::new(dir.path());
        let event = TraceEvent {
            run_id: "r1".to_string(),
            parent_run_id: None,
            level: TraceLevel::Info,
            message: "hello".to_string(),
            timestamp: Utc::now(),
            cut_id: Uuid::now_v7(),
            workflow: "wf".to_string(),
            job: None,
            stage: None,
            duration_ms: None,
            exception: None,
        };
        sink.emit(&event).await.unwrap();
        sink.emit(&event).await.unwrap();
        let body = std::fs::read_to_string(dir.path().join("r1.jsonl")).unwrap();
        assert_eq!(body.lines().count(), 2);
        let parsed: TraceEvent = serde_json::from_str(body.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.message, "hello");
    }
}
