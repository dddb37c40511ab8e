use std::fmt;

use serde::{Deserialize, Serialize};

/// Action taken by the PII scanner once it finds a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PiiAction {
    Redact,
    Block,
    LogOnly,
}

impl fmt::Display for PiiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PiiAction::Redact => "redact",
            PiiAction::Block => "block",
            PiiAction::LogOnly => "log_only",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid PII_ACTION value: {0}")]
pub struct ParsePiiActionError(String);

impl std::str::FromStr for PiiAction {
    type Err = ParsePiiActionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "redact" => Ok(PiiAction::Redact),
            "block" => Ok(PiiAction::Block),
            "log_only" => Ok(PiiAction::LogOnly),
            other => Err(ParsePiiActionError(other.to_string())),
        }
    }
}

/// Backend selection for the client config store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStoreBackendKind {
    Json,
    RemoteTable,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid CLIENT_STORE_BACKEND value: {0}")]
pub struct ParseClientStoreBackendError(String);

impl std::str::FromStr for ClientStoreBackendKind {
    type Err = ParseClientStoreBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ClientStoreBackendKind::Json),
            "remote-table" => Ok(ClientStoreBackendKind::RemoteTable),
            other => Err(ParseClientStoreBackendError(other.to_string())),
        }
    }
}

/// Upstream provider tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTag {
    OpenAi,
    Bedrock,
}

impl fmt::Display for ProviderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderTag::OpenAi => "openai",
            ProviderTag::Bedrock => "bedrock",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid provider tag: {0}")]
pub struct ParseProviderTagError(String);

impl std::str::FromStr for ProviderTag {
    type Err = ParseProviderTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(ProviderTag::OpenAi),
            "bedrock" => Ok(ProviderTag::Bedrock),
            other => Err(ParseProviderTagError(other.to_string())),
        }
    }
}

/// Resolved runtime configuration.
///
/// This is a plain data type: nothing in this crate or in `llmgate-core`
/// reads the environment directly. The binary crate (`apps/llmgate`) is the
/// only place that resolves env vars / CLI flags into this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// `GATEWAY_API_KEYS` — comma-separated legacy keys (client store "legacy flat" backend).
    pub legacy_api_keys: Vec<String>,
    /// `UPSTREAM_BASE_URL`
    pub upstream_base_url: String,
    /// `UPSTREAM_API_KEY` — default credential used when a client has none of its own.
    pub upstream_api_key: Option<String>,
    /// `INJECTION_THRESHOLD`
    pub injection_threshold: f64,
    /// `PII_ACTION` — request-side mode.
    pub pii_action: PiiAction,
    /// `RESPONSE_PII_ACTION` — response-side mode.
    pub response_pii_action: PiiAction,
    /// `RATE_LIMIT_RPM` — default per-client requests-per-minute.
    pub rate_limit_rpm: u32,
    /// `CLIENT_STORE_BACKEND`
    pub client_store_backend: ClientStoreBackendKind,
    /// `CLIENT_CONFIG_PATH`
    pub client_config_path: String,
    /// `LOG_LEVEL`
    pub log_level: String,
    /// `AUDIT_LOG_FILE` — empty means stdout.
    pub audit_log_file: Option<String>,
    /// Whether the serving surface can stream responses.
    pub streaming_supported: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            legacy_api_keys: vec!["dev-key-1".to_string()],
            upstream_base_url: "https://api.openai.com".to_string(),
            upstream_api_key: None,
            injection_threshold: 0.7,
            pii_action: PiiAction::Redact,
            response_pii_action: PiiAction::LogOnly,
            rate_limit_rpm: 60,
            client_store_backend: ClientStoreBackendKind::Json,
            client_config_path: "clients.json".to_string(),
            log_level: "INFO".to_string(),
            audit_log_file: None,
            streaming_supported: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.legacy_api_keys, vec!["dev-key-1".to_string()]);
        assert_eq!(cfg.upstream_base_url, "https://api.openai.com");
        assert_eq!(cfg.injection_threshold, 0.7);
        assert_eq!(cfg.pii_action, PiiAction::Redact);
        assert_eq!(cfg.response_pii_action, PiiAction::LogOnly);
        assert_eq!(cfg.rate_limit_rpm, 60);
        assert_eq!(cfg.client_store_backend, ClientStoreBackendKind::Json);
        assert_eq!(cfg.client_config_path, "clients.json");
    }

    #[test]
    fn pii_action_round_trips_through_str() {
        assert_eq!("redact".parse::<PiiAction>().unwrap(), PiiAction::Redact);
        assert_eq!("block".parse::<PiiAction>().unwrap(), PiiAction::Block);
        assert_eq!("log_only".parse::<PiiAction>().unwrap(), PiiAction::LogOnly);
        assert!("bogus".parse::<PiiAction>().is_err());
    }
}
