use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use llmgate_common::PiiAction;
use llmgate_protocol::{sse, CanonicalChunk};
use llmgate_provider_core::ChunkStream;
use llmgate_security::{scan_injection, scan_pii};
use serde_json::json;

use crate::audit::AuditOutcome;
use crate::pipeline::{GatewayPipeline, StreamAuditContext, StreamCompletion};

/// Finalizes the one audit record a streaming request is still owed if the
/// stream is dropped before [`coordinate`]'s loop reaches a terminal state
/// — a client disconnect.
struct CancellationGuard {
    pipeline: Arc<GatewayPipeline>,
    audit_ctx: Option<StreamAuditContext>,
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        if let Some(audit_ctx) = self.audit_ctx.take() {
            let pipeline = self.pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .finish_streaming_audit(
                        audit_ctx,
                        StreamCompletion { outcome: AuditOutcome::ClientCancelled, response_scan: json!({}) },
                    )
                    .await;
            });
        }
    }
}

fn error_frame(code: &str, message: &str, trace_id: &str) -> Bytes {
    let payload = json!({
        "error": { "type": code, "message": message, "request_id": trace_id }
    })
    .to_string();
    sse::encode_data_frame(&payload)
}

/// Drives an upstream [`ChunkStream`] to the client with no buffering
/// latency, accumulating the complete text so the response-side scanners
/// can run once the terminal sentinel arrives, and holds that sentinel
/// until the scan decides whether to release it or replace it with a
/// `response_blocked` error event.
///
/// A single inline consumer loop (`stream::unfold`), not a reader/writer
/// task pair — the hold-the-terminal-sentinel logic is one `match` on
/// chunk kind, and `CancellationGuard` (not a second task) observes a
/// client disconnect by way of being dropped.
pub fn coordinate(
    pipeline: Arc<GatewayPipeline>,
    trace_id: String,
    upstream: ChunkStream,
    audit_ctx: StreamAuditContext,
    response_pii_action: PiiAction,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> {
    let guard = CancellationGuard { pipeline: pipeline.clone(), audit_ctx: Some(audit_ctx) };

    futures_util::stream::unfold(
        (upstream, String::new(), guard, trace_id, pipeline, false),
        move |(mut upstream, mut accumulated, mut guard, trace_id, pipeline, done)| async move {
            if done {
                return None;
            }

            match upstream.next().await {
                Some(Ok(CanonicalChunk::Delta { text, raw })) => {
                    accumulated.push_str(&text);
                    Some((Ok(raw), (upstream, accumulated, guard, trace_id, pipeline, false)))
                }
                Some(Ok(CanonicalChunk::Event { raw })) => {
                    Some((Ok(raw), (upstream, accumulated, guard, trace_id, pipeline, false)))
                }
                Some(Ok(CanonicalChunk::Done)) => {
                    let injection = scan_injection(&accumulated.to_lowercase());
                    let pii = scan_pii(&accumulated, response_pii_action);
                    let pii_kinds: Vec<String> =
                        pii.findings.iter().map(|f| format!("{:?}", f.kind)).collect();
                    let response_scan = json!({
                        "injection_score": injection.score,
                        "pii_findings": pii_kinds,
                        "blocked": pii.blocked,
                    });

                    let audit_ctx = guard.audit_ctx.take().expect("audit not yet finalized");
                    let outcome = AuditOutcome::Allowed;
                    let pipeline_for_audit = pipeline.clone();
                    let response_scan_for_audit = response_scan.clone();
                    tokio::spawn(async move {
                        pipeline_for_audit
                            .finish_streaming_audit(
                                audit_ctx,
                                StreamCompletion { outcome, response_scan: response_scan_for_audit },
                            )
                            .await;
                    });

                    let frame = if pii.blocked {
                        error_frame(
                            "response_blocked",
                            "response blocked by PII scanner",
                            &trace_id,
                        )
                    } else {
                        sse::encode_data_frame(sse::DONE_PAYLOAD)
                    };
                    Some((Ok(frame), (upstream, accumulated, guard, trace_id, pipeline, true)))
                }
                Some(Err(err)) => {
                    let audit_ctx = guard.audit_ctx.take().expect("audit not yet finalized");
                    let pipeline_for_audit = pipeline.clone();
                    tokio::spawn(async move {
                        pipeline_for_audit
                            .finish_streaming_audit(
                                audit_ctx,
                                StreamCompletion {
                                    outcome: AuditOutcome::UpstreamError,
                                    response_scan: json!({}),
                                },
                            )
                            .await;
                    });
                    let frame = error_frame("upstream_error", &err.to_string(), &trace_id);
                    Some((Ok(frame), (upstream, accumulated, guard, trace_id, pipeline, true)))
                }
                None => {
                    // Upstream closed without an explicit terminal sentinel;
                    // treat like an empty Done so a record is still emitted.
                    let audit_ctx = guard.audit_ctx.take().expect("audit not yet finalized");
                    let pipeline_for_audit = pipeline.clone();
                    tokio::spawn(async move {
                        pipeline_for_audit
                            .finish_streaming_audit(
                                audit_ctx,
                                StreamCompletion { outcome: AuditOutcome::Allowed, response_scan: json!({}) },
                            )
                            .await;
                    });
                    Some((
                        Ok(sse::encode_data_frame(sse::DONE_PAYLOAD)),
                        (upstream, accumulated, guard, trace_id, pipeline, true),
                    ))
                }
            }
        },
    )
}
