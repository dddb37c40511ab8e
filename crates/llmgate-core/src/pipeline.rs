use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::HeaderMap;
use llmgate_clients::ClientStore;
use llmgate_common::{GatewayConfig, PiiAction, ProviderTag};
use llmgate_protocol::{CanonicalRequest, CanonicalResponse};
use llmgate_provider_core::{ChunkStream, ProviderRegistry, RequestContext as ProviderContext};
use llmgate_ratelimit::{RateLimitDecision, RateLimiter};
use llmgate_security::{scan_injection, scan_pii};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::audit::{AuditOutcome, AuditRecord, AuditRecorder, PipelineStage, StageAudit};
use crate::error::GatewayError;
use crate::stages::{PipelineContext, Stage};

/// Everything a streaming response needs in order to finish its audit
/// record once the post-scan completes. Handed back to the caller alongside
/// the upstream [`ChunkStream`] so `llmgate-router` can drive
/// [`crate::stream_coordinator::coordinate`] and then call
/// [`GatewayPipeline::finish_streaming_audit`].
pub struct StreamAuditContext {
    trace_id: String,
    started_at: Instant,
    client_id: Option<String>,
    model: Option<String>,
    provider: Option<ProviderTag>,
    stages: Vec<StageAudit>,
}

/// What `llmgate-router`/the stream coordinator learned once the terminal
/// sentinel (or a cancellation) was reached.
pub struct StreamCompletion {
    pub outcome: AuditOutcome,
    pub response_scan: serde_json::Value,
}

/// Result of running the full pipeline for one request up through the
/// point where the client either gets a complete answer or a stream begins.
pub enum PipelineOutcome {
    Rejected(GatewayError),
    NonStreaming(CanonicalResponse),
    Streaming { chunks: ChunkStream, audit_ctx: StreamAuditContext, response_pii_action: PiiAction },
}

pub struct HandleResult {
    pub trace_id: String,
    pub rate_limit: Option<RateLimitDecision>,
    pub outcome: PipelineOutcome,
}

/// Sequences the stages in a fixed order, forwards accepted requests
/// through the selected provider, and (for non-streaming requests) runs the
/// response-side scan before handing the reply back.
pub struct GatewayPipeline {
    stages: Vec<Box<dyn Stage>>,
    registry: Arc<ProviderRegistry>,
    audit: AuditRecorder,
    response_pii_action: PiiAction,
    upstream_base_url: String,
    default_upstream_api_key: Option<String>,
}

impl GatewayPipeline {
    pub fn new(
        config: &GatewayConfig,
        client_store: Arc<dyn ClientStore>,
        rate_limiter: Arc<RateLimiter>,
        registry: Arc<ProviderRegistry>,
        audit: AuditRecorder,
    ) -> Self {
        use crate::stages::{
            AuthenticateStage, InjectionScanStage, ModelAllowlistStage, RateLimitStage,
            RequestPiiScanStage, StreamingGateStage,
        };

        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(AuthenticateStage { store: client_store }),
            Box::new(RateLimitStage { limiter: rate_limiter, default_rpm: config.rate_limit_rpm }),
            Box::new(ModelAllowlistStage),
            Box::new(InjectionScanStage { threshold: config.injection_threshold }),
            Box::new(RequestPiiScanStage { mode: config.pii_action }),
            Box::new(StreamingGateStage { streaming_supported: config.streaming_supported }),
        ];

        Self {
            stages,
            registry,
            audit,
            response_pii_action: config.response_pii_action,
            upstream_base_url: config.upstream_base_url.clone(),
            default_upstream_api_key: config.upstream_api_key.clone(),
        }
    }

    pub fn audit(&self) -> &AuditRecorder {
        &self.audit
    }

    /// Parse the body, run every stage in order, and on acceptance forward
    /// to the provider — non-streaming replies get their response-side scan
    /// run here; streaming replies are handed back unscanned for the caller
    /// to drive through [`crate::stream_coordinator::coordinate`].
    pub async fn handle(&self, headers: HeaderMap, body: Bytes) -> HandleResult {
        let trace_id = Uuid::now_v7().to_string();
        let started_at = Instant::now();

        let request: CanonicalRequest = match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => {
                return self.finish_rejected(
                    trace_id,
                    started_at,
                    None,
                    None,
                    Vec::new(),
                    None,
                    GatewayError::InvalidRequest(err.to_string()),
                );
            }
        };
        if let Err(err) = request.validate() {
            return self.finish_rejected(
                trace_id,
                started_at,
                None,
                Some(request.model.clone()),
                Vec::new(),
                None,
                GatewayError::InvalidRequest(err.to_string()),
            );
        }

        let model = request.model.clone();
        let stream_requested = request.stream;
        let mut ctx = PipelineContext::new(headers, request);
        let mut stage_audits = Vec::with_capacity(self.stages.len());
        let mut rate_limit = None;

        for stage in &self.stages {
            let name = stage.name();
            let outcome = stage.evaluate(&mut ctx).await;
            if matches!(name, PipelineStage::RateLimit) {
                rate_limit = ctx.rate_limit;
            }
            let allow = outcome.allow;
            let reason_code = outcome.error.as_ref().map(|e| e.code());
            stage_audits.push(StageAudit { name, allow, reason_code, detail: outcome.detail });

            if let Some(error) = outcome.error {
                let client_id = ctx.client.as_ref().map(|c| c.client_id.clone());
                return self.finish_rejected(
                    trace_id,
                    started_at,
                    client_id,
                    Some(model),
                    stage_audits,
                    rate_limit,
                    error,
                );
            }
        }

        let client = ctx.client.clone().expect("authenticate stage always runs first");
        let request = ctx.request.take().expect("request body parsed at pipeline start");
        let provider_tag = client.provider;
        let Some(provider) = self.registry.get(provider_tag) else {
            return self.finish_rejected(
                trace_id,
                started_at,
                Some(client.client_id),
                Some(model),
                stage_audits,
                rate_limit,
                GatewayError::Internal,
            );
        };

        let provider_ctx = ProviderContext {
            trace_id: trace_id.clone(),
            client_id: client.client_id.clone(),
            upstream_api_key: client.upstream_api_key.clone().or_else(|| self.default_upstream_api_key.clone()),
            upstream_base_url: Some(self.upstream_base_url.clone()),
        };

        if stream_requested {
            let chunks = match provider.call_stream(request, &provider_ctx).await {
                Ok(chunks) => chunks,
                Err(err) => {
                    stage_audits.push(StageAudit {
                        name: PipelineStage::Forward,
                        allow: false,
                        reason_code: Some("upstream_error"),
                        detail: json!({ "message": err.to_string() }),
                    });
                    return self.finish_rejected(
                        trace_id,
                        started_at,
                        Some(client.client_id),
                        Some(model),
                        stage_audits,
                        rate_limit,
                        GatewayError::Upstream(err),
                    );
                }
            };
            stage_audits.push(StageAudit {
                name: PipelineStage::Forward,
                allow: true,
                reason_code: None,
                detail: json!({}),
            });
            let audit_ctx = StreamAuditContext {
                trace_id: trace_id.clone(),
                started_at,
                client_id: Some(client.client_id),
                model: Some(model),
                provider: Some(provider_tag),
                stages: stage_audits,
            };
            return HandleResult {
                trace_id,
                rate_limit,
                outcome: PipelineOutcome::Streaming {
                    chunks,
                    audit_ctx,
                    response_pii_action: self.response_pii_action,
                },
            };
        }

        let upstream_started = Instant::now();
        let response = match provider.call(request, &provider_ctx).await {
            Ok(response) => response,
            Err(err) => {
                stage_audits.push(StageAudit {
                    name: PipelineStage::Forward,
                    allow: false,
                    reason_code: Some("upstream_error"),
                    detail: json!({ "message": err.to_string() }),
                });
                return self.finish_rejected(
                    trace_id,
                    started_at,
                    Some(client.client_id),
                    Some(model),
                    stage_audits,
                    rate_limit,
                    GatewayError::Upstream(err),
                );
            }
        };
        let upstream_latency_ms = upstream_started.elapsed().as_millis() as u64;
        stage_audits.push(StageAudit {
            name: PipelineStage::Forward,
            allow: true,
            reason_code: None,
            detail: json!({ "latency_ms": upstream_latency_ms }),
        });

        // Response-side scan: injection is always advisory; PII follows
        // `RESPONSE_PII_ACTION`.
        let text = response.combined_text();
        let injection = scan_injection(&text.to_lowercase());
        let pii = scan_pii(&text, self.response_pii_action);
        let pii_kinds: Vec<String> = pii.findings.iter().map(|f| format!("{:?}", f.kind)).collect();
        let response_scan = json!({
            "injection_score": injection.score,
            "pii_findings": pii_kinds.clone(),
            "blocked": pii.blocked,
        });
        stage_audits.push(StageAudit {
            name: PipelineStage::ResponseScan,
            allow: !pii.blocked,
            reason_code: if pii.blocked { Some("response_blocked") } else { None },
            detail: response_scan.clone(),
        });

        if pii.blocked {
            return self.finish_with_outcome(
                trace_id,
                started_at,
                Some(client.client_id),
                Some(model),
                Some(provider_tag),
                stream_requested,
                stage_audits,
                rate_limit,
                Some(upstream_latency_ms),
                response_scan,
                AuditOutcome::Denied,
                PipelineOutcome::Rejected(GatewayError::ResponsePiiBlocked { kinds: pii_kinds }),
            );
        }

        let response = if matches!(self.response_pii_action, PiiAction::Redact) {
            response.with_combined_content(&pii.redacted_text)
        } else {
            response
        };

        self.finish_with_outcome(
            trace_id,
            started_at,
            Some(client.client_id),
            Some(model),
            Some(provider_tag),
            stream_requested,
            stage_audits,
            rate_limit,
            Some(upstream_latency_ms),
            response_scan,
            AuditOutcome::Allowed,
            PipelineOutcome::NonStreaming(response),
        )
    }

    /// Finish a request whose pipeline result is already known, recording
    /// the audit line exactly once before handing control back.
    #[allow(clippy::too_many_arguments)]
    fn finish_with_outcome(
        &self,
        trace_id: String,
        started_at: Instant,
        client_id: Option<String>,
        model: Option<String>,
        provider: Option<ProviderTag>,
        stream: bool,
        stages: Vec<StageAudit>,
        rate_limit: Option<RateLimitDecision>,
        upstream_latency_ms: Option<u64>,
        response_scan: serde_json::Value,
        outcome: AuditOutcome,
        result: PipelineOutcome,
    ) -> HandleResult {
        let record = AuditRecord {
            request_id: trace_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
            client_id,
            model,
            provider: provider.map(|p| p.to_string()),
            stream,
            stages,
            upstream_latency_ms,
            response_scan,
            outcome,
        };
        let audit = self.audit.clone();
        tokio::spawn(async move { audit.record(record).await });
        let _ = started_at;
        HandleResult { trace_id, rate_limit, outcome: result }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish_rejected(
        &self,
        trace_id: String,
        started_at: Instant,
        client_id: Option<String>,
        model: Option<String>,
        stages: Vec<StageAudit>,
        rate_limit: Option<RateLimitDecision>,
        error: GatewayError,
    ) -> HandleResult {
        let outcome = if matches!(error, GatewayError::Upstream(_) | GatewayError::UpstreamTimeout) {
            AuditOutcome::UpstreamError
        } else {
            AuditOutcome::Denied
        };
        self.finish_with_outcome(
            trace_id,
            started_at,
            client_id,
            model,
            None,
            false,
            stages,
            rate_limit,
            None,
            json!({}),
            outcome,
            PipelineOutcome::Rejected(error),
        )
    }

    /// Called by the caller driving [`crate::stream_coordinator::coordinate`]
    /// once the terminal sentinel, a block, or a client cancellation has
    /// been reached, finishing the one audit record a streaming request
    /// never got to emit in [`Self::handle`].
    pub async fn finish_streaming_audit(&self, ctx: StreamAuditContext, completion: StreamCompletion) {
        let record = AuditRecord {
            request_id: ctx.trace_id,
            timestamp: OffsetDateTime::now_utc(),
            client_id: ctx.client_id,
            model: ctx.model,
            provider: ctx.provider.map(|p| p.to_string()),
            stream: true,
            stages: ctx.stages,
            upstream_latency_ms: Some(ctx.started_at.elapsed().as_millis() as u64),
            response_scan: completion.response_scan,
            outcome: completion.outcome,
        };
        self.audit.record(record).await;
    }
}
