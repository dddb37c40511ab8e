use llmgate_common::ProviderTag;
use serde::{Deserialize, Serialize};

/// Everything the gateway knows about a single client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    /// Models this client may request. Empty means "all models allowed".
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_provider")]
    pub provider: ProviderTag,
    /// Overrides the gateway-wide default when set.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
    /// Credential forwarded upstream on this client's behalf. Falls back to
    /// the gateway's own `UPSTREAM_API_KEY` when absent.
    #[serde(default)]
    pub upstream_api_key: Option<String>,
}

fn default_provider() -> ProviderTag {
    ProviderTag::OpenAi
}

impl ClientConfig {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty() || self.allowed_models.iter().any(|m| m == model)
    }
}
