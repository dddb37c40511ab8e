use http::StatusCode;
use llmgate_provider_core::ProviderError;
use serde_json::json;

/// Everything that can end a request before (or instead of) a forwarded
/// upstream call. Carries enough detail for both the HTTP response and the
/// audit record; `llmgate-router` only needs to ask for `status()`/`body()`.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing or unknown api key")]
    Unauthenticated,
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("model not allowed for this client")]
    ModelNotAllowed { model: String },
    #[error("request blocked by injection scanner, score={score:.2}")]
    InjectionBlocked { score: f64 },
    #[error("request blocked by PII scanner")]
    PiiBlocked { kinds: Vec<String> },
    #[error("response blocked by PII scanner")]
    ResponsePiiBlocked { kinds: Vec<String> },
    #[error("streaming requested but not supported on this deployment")]
    StreamingUnsupported,
    #[error("malformed request: {0}")]
    InvalidRequest(String),
    #[error("upstream error: {0}")]
    Upstream(#[from] ProviderError),
    #[error("upstream deadline exceeded")]
    UpstreamTimeout,
    #[error("internal error")]
    Internal,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ModelNotAllowed { .. } => StatusCode::FORBIDDEN,
            GatewayError::InjectionBlocked { .. } => StatusCode::BAD_REQUEST,
            GatewayError::PiiBlocked { .. } => StatusCode::BAD_REQUEST,
            GatewayError::ResponsePiiBlocked { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::StreamingUnsupported => StatusCode::BAD_REQUEST,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream(ProviderError::UpstreamStatus { status, .. }) => *status,
            GatewayError::Upstream(ProviderError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "unauthenticated",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::ModelNotAllowed { .. } => "model_not_allowed",
            GatewayError::InjectionBlocked { .. } => "injection_blocked",
            GatewayError::PiiBlocked { .. } => "pii_blocked",
            GatewayError::ResponsePiiBlocked { .. } => "response_blocked",
            GatewayError::StreamingUnsupported => "streaming_unsupported",
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::Upstream(ProviderError::Timeout) => "upstream_timeout",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::UpstreamTimeout => "upstream_timeout",
            GatewayError::Internal => "internal_error",
        }
    }

    /// `{"error": {"type", "message", "request_id"}}`.
    pub fn body(&self, request_id: &str) -> serde_json::Value {
        json!({
            "error": {
                "type": self.code(),
                "message": self.to_string(),
                "request_id": request_id,
            }
        })
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
