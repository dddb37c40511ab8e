use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{broadcast, RwLock};

/// Which pipeline stage produced the final outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Authenticate,
    RateLimit,
    ModelAllowlist,
    InjectionScan,
    RequestPiiScan,
    StreamingGate,
    Forward,
    ResponseScan,
}

/// One stage's contribution to an [`AuditRecord`].
#[derive(Debug, Clone, Serialize)]
pub struct StageAudit {
    pub name: PipelineStage,
    pub allow: bool,
    pub reason_code: Option<&'static str>,
    pub detail: serde_json::Value,
}

/// Final disposition of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    UpstreamError,
    ClientCancelled,
}

/// One JSON line per request, emitted exactly once even when the request is
/// rejected before reaching the upstream.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub request_id: String,
    #[serde(rename = "timestamp_iso", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub client_id: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub stream: bool,
    pub stages: Vec<StageAudit>,
    pub upstream_latency_ms: Option<u64>,
    pub response_scan: serde_json::Value,
    pub outcome: AuditOutcome,
}

pub trait AuditSink: Send + Sync {
    fn write<'a>(&'a self, record: &'a AuditRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Writes each record as a single JSON line to stdout.
pub struct StdoutSink;

impl AuditSink for StdoutSink {
    fn write<'a>(&'a self, record: &'a AuditRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            match serde_json::to_string(record) {
                Ok(line) => println!("{line}"),
                Err(error) => tracing::error!(%error, "failed to serialize audit record"),
            }
        })
    }
}

/// Appends each record as a JSON line to a file (`AUDIT_LOG_FILE`).
pub struct FileSink {
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileSink {
    pub async fn open(path: &str) -> std::io::Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        Ok(Self { file: tokio::sync::Mutex::new(file) })
    }
}

impl AuditSink for FileSink {
    fn write<'a>(&'a self, record: &'a AuditRecord) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;
            let Ok(mut line) = serde_json::to_string(record) else {
                tracing::error!("failed to serialize audit record");
                return;
            };
            line.push('\n');
            let mut file = self.file.lock().await;
            if let Err(error) = file.write_all(line.as_bytes()).await {
                tracing::error!(%error, "failed to append audit record to file");
            }
        })
    }
}

/// Fan-out hub for audit records: every record is pushed to a broadcast
/// channel for live subscribers (e.g. a future admin stream) and to every
/// registered sink.
#[derive(Clone)]
pub struct AuditRecorder {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<AuditRecord>,
    sinks: RwLock<Vec<Arc<dyn AuditSink>>>,
}

impl AuditRecorder {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { inner: Arc::new(Inner { tx, sinks: RwLock::new(Vec::new()) }) }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn AuditSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn record(&self, record: AuditRecord) {
        let _ = self.inner.tx.send(record.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let record = record.clone();
            tokio::spawn(async move {
                sink.write(&record).await;
            });
        }
    }
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}
