use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use llmgate_clients::LegacyFlatStore;
use llmgate_common::GatewayConfig;
use llmgate_core::{AuditRecorder, GatewayPipeline};
use llmgate_protocol::{CanonicalChunk, CanonicalRequest, CanonicalResponse, Choice, Message, Role, Usage};
use llmgate_provider_core::{ChunkStream, Provider, ProviderError, ProviderRegistry, RequestContext};
use llmgate_ratelimit::RateLimiter;
use tower::ServiceExt;

struct EchoProvider;

#[async_trait]
impl Provider for EchoProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn call(
        &self,
        req: CanonicalRequest,
        _ctx: &RequestContext,
    ) -> Result<CanonicalResponse, ProviderError> {
        Ok(CanonicalResponse {
            id: "resp-1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: req.model,
            choices: vec![Choice {
                index: 0,
                message: Message { role: Role::Assistant, content: "hi".to_string() },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage { prompt_tokens: 1, completion_tokens: 1, total_tokens: 2 }),
            extra: serde_json::Map::new(),
        })
    }

    async fn call_stream(&self, _req: CanonicalRequest, _ctx: &RequestContext) -> Result<ChunkStream, ProviderError> {
        let items = vec![Ok(CanonicalChunk::Done)];
        Ok(Box::pin(tokio_stream::iter(items)))
    }
}

fn build_app() -> axum::Router {
    let config = GatewayConfig::default();
    let store = Arc::new(LegacyFlatStore::from_keys(&config.legacy_api_keys));
    let limiter = Arc::new(RateLimiter::new());
    let mut registry = ProviderRegistry::new();
    registry.register(llmgate_common::ProviderTag::OpenAi, Arc::new(EchoProvider));
    let pipeline = Arc::new(GatewayPipeline::new(
        &config,
        store,
        limiter,
        Arc::new(registry),
        AuditRecorder::new(),
    ));
    llmgate_router::router(pipeline)
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let app = build_app();
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn chat_completions_rejects_missing_api_key() {
    let app = build_app();
    let body = serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
    });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("x-request-id"));
}

#[tokio::test]
async fn chat_completions_accepts_known_key() {
    let app = build_app();
    let body = serde_json::json!({
        "model": "gpt-4o-mini",
        "messages": [{"role": "user", "content": "hi"}],
    });
    let req = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-api-key", "dev-key-1")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-ratelimit-remaining"));
}
