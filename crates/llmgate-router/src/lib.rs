use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use llmgate_core::{GatewayPipeline, HandleResult, PipelineOutcome, coordinate};
use llmgate_ratelimit::RateLimitDecision;
use serde_json::json;

/// Shared handler state: one `Arc`-wrapped engine handle cloned into every
/// request.
#[derive(Clone)]
pub struct GatewayState {
    pub pipeline: Arc<GatewayPipeline>,
}

pub fn router(pipeline: Arc<GatewayPipeline>) -> Router {
    let state = GatewayState { pipeline };
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

fn rate_limit_headers(headers: &mut HeaderMap, decision: Option<RateLimitDecision>) {
    let Some(decision) = decision else { return };
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", v);
    }
    let reset_secs = if decision.allowed { 60 } else { decision.retry_after_secs };
    if let Ok(v) = HeaderValue::from_str(&reset_secs.to_string()) {
        headers.insert("x-ratelimit-reset", v);
    }
    if !decision.allowed {
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after_secs.to_string()) {
            headers.insert(header::RETRY_AFTER, v);
        }
    }
}

async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let HandleResult { trace_id, rate_limit, outcome } = state.pipeline.handle(headers, body).await;

    let mut response = match outcome {
        PipelineOutcome::Rejected(error) => {
            let status = error.status();
            tracing::info!(trace_id = %trace_id, status = status.as_u16(), code = error.code(), "request rejected");
            let body = error.body(&trace_id);
            (status, Json(body)).into_response()
        }
        PipelineOutcome::NonStreaming(canonical) => (StatusCode::OK, Json(canonical)).into_response(),
        PipelineOutcome::Streaming { chunks, audit_ctx, response_pii_action } => {
            let frames = coordinate(state.pipeline.clone(), trace_id.clone(), chunks, audit_ctx, response_pii_action);
            let body = Body::from_stream(frames);
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::OK;
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
    };

    if let Ok(v) = HeaderValue::from_str(&trace_id) {
        response.headers_mut().insert("x-request-id", v);
    }
    rate_limit_headers(response.headers_mut(), rate_limit);
    response
}
