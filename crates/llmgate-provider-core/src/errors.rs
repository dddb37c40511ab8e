use std::fmt;

use http::StatusCode;

/// Failure modes a [`crate::Provider`] adapter can surface.
#[derive(Debug, Clone)]
pub enum ProviderError {
    /// The adapter couldn't reach the upstream at all (DNS, TCP, TLS).
    Transport { message: String },
    /// The configured deadline elapsed before the upstream responded.
    Timeout,
    /// The upstream answered with a non-2xx status; forwarded to the client
    /// as-is rather than translated.
    UpstreamStatus { status: StatusCode, body: bytes::Bytes },
    /// A required credential or configuration field was missing.
    MissingCredential(&'static str),
    Other(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transport { message } => write!(f, "upstream transport error: {message}"),
            ProviderError::Timeout => write!(f, "upstream deadline exceeded"),
            ProviderError::UpstreamStatus { status, .. } => {
                write!(f, "upstream responded with status {status}")
            }
            ProviderError::MissingCredential(field) => {
                write!(f, "missing credential field: {field}")
            }
            ProviderError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

pub type ProviderResult<T> = Result<T, ProviderError>;
