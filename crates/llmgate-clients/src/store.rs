use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::HeaderMap;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::ClientConfig;

/// Pull the presented credential out of either `x-api-key` or a Bearer
/// `authorization` header. Mirrors the header precedence a reverse proxy
/// already in front of an upstream API would use.
pub fn extract_presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = header_str(headers, "x-api-key") {
        return Some(value);
    }
    let auth = header_str(headers, "authorization")?;
    let trimmed = auth.trim();
    trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))
        .map(|token| token.trim().to_string())
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(|v| v.to_string())
}

fn digest(key: &str) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

/// Compare `presented` against every entry in `table`, in constant time with
/// respect to the identity of the matching entry. Iterates the whole table
/// rather than short-circuiting on the first hit.
fn constant_time_lookup<'a, V>(
    table: &'a [([u8; 32], V)],
    presented: &str,
) -> Option<&'a V> {
    let presented_digest = digest(presented);
    let mut found: Option<&V> = None;
    for (stored_digest, value) in table {
        let matches: bool = stored_digest.ct_eq(&presented_digest).into();
        if matches {
            found = Some(value);
        }
    }
    found
}

#[async_trait::async_trait]
pub trait ClientStore: Send + Sync {
    /// Resolve the caller's configuration from request headers, or `None`
    /// when the presented credential doesn't match any known client.
    async fn authenticate(&self, headers: &HeaderMap) -> Option<ClientConfig>;
}

/// Backend over a static JSON document mapping API key to [`ClientConfig`]
/// (`CLIENT_STORE_BACKEND=json`).
pub struct StaticJsonStore {
    table: Vec<([u8; 32], ClientConfig)>,
}

impl StaticJsonStore {
    /// `document` is `{ "<api-key>": { ...ClientConfig fields... }, ... }`.
    pub fn from_document(document: HashMap<String, ClientConfig>) -> Self {
        let table = document
            .into_iter()
            .map(|(key, config)| (digest(&key), config))
            .collect();
        Self { table }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let document: HashMap<String, ClientConfig> = serde_json::from_str(raw)?;
        Ok(Self::from_document(document))
    }
}

#[async_trait::async_trait]
impl ClientStore for StaticJsonStore {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<ClientConfig> {
        let presented = extract_presented_key(headers)?;
        constant_time_lookup(&self.table, &presented).cloned()
    }
}

/// Backend over `GATEWAY_API_KEYS`, the flat comma-separated legacy list.
/// Every key maps to an unrestricted client using the gateway-wide defaults.
pub struct LegacyFlatStore {
    table: Vec<([u8; 32], ClientConfig)>,
}

impl LegacyFlatStore {
    pub fn from_keys(keys: &[String]) -> Self {
        let table = keys
            .iter()
            .map(|key| {
                (
                    digest(key),
                    ClientConfig {
                        client_id: format!("legacy:{}", &key[..key.len().min(8)]),
                        allowed_models: Vec::new(),
                        provider: llmgate_common::ProviderTag::OpenAi,
                        rate_limit_rpm: None,
                        upstream_api_key: None,
                    },
                )
            })
            .collect();
        Self { table }
    }
}

#[async_trait::async_trait]
impl ClientStore for LegacyFlatStore {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<ClientConfig> {
        let presented = extract_presented_key(headers)?;
        constant_time_lookup(&self.table, &presented).cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemoteTableError {
    #[error("remote client table request failed: {0}")]
    Request(#[from] wreq::Error),
    #[error("remote client table returned status {0}")]
    Status(http::StatusCode),
}

struct CacheEntry {
    config: Option<ClientConfig>,
    fetched_at: Instant,
}

/// Backend that resolves clients against an external key-value service.
/// Successful and negative lookups are cached briefly so a hot key doesn't
/// round-trip to the remote table on every request.
pub struct RemoteTableStore {
    base_url: String,
    http: wreq::Client,
    cache: DashMap<String, CacheEntry>,
    cache_ttl: Duration,
}

impl RemoteTableStore {
    pub fn new(base_url: impl Into<String>) -> Result<Self, wreq::Error> {
        Ok(Self {
            base_url: base_url.into(),
            http: wreq::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(5))
                .build()?,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(30),
        })
    }

    async fn fetch(&self, presented: &str) -> Result<Option<ClientConfig>, RemoteTableError> {
        let url = format!("{}/clients/{}", self.base_url, presented);
        let response = self
            .http
            .request(http::Method::GET, &url)
            .send()
            .await?;
        if response.status() == http::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(RemoteTableError::Status(response.status()));
        }
        let body = response.bytes().await?;
        let config: ClientConfig = serde_json::from_slice(&body)
            .map_err(|_| RemoteTableError::Status(http::StatusCode::UNPROCESSABLE_ENTITY))?;
        Ok(Some(config))
    }
}

#[async_trait::async_trait]
impl ClientStore for RemoteTableStore {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<ClientConfig> {
        let presented = extract_presented_key(headers)?;

        if let Some(entry) = self.cache.get(&presented) {
            if entry.fetched_at.elapsed() < self.cache_ttl {
                return entry.config.clone();
            }
        }

        let config = match self.fetch(&presented).await {
            Ok(config) => config,
            Err(error) => {
                tracing::warn!(%error, "remote client table lookup failed");
                return None;
            }
        };

        self.cache.insert(
            presented,
            CacheEntry { config: config.clone(), fetched_at: Instant::now() },
        );
        config
    }
}

/// Tries each backend in order, returning the first match. Used when a
/// deployment wants legacy flat keys to keep working alongside a newer
/// JSON-backed client table.
pub struct ChainedStore {
    backends: Vec<Arc<dyn ClientStore>>,
}

impl ChainedStore {
    pub fn new(backends: Vec<Arc<dyn ClientStore>>) -> Self {
        Self { backends }
    }
}

#[async_trait::async_trait]
impl ClientStore for ChainedStore {
    async fn authenticate(&self, headers: &HeaderMap) -> Option<ClientConfig> {
        for backend in &self.backends {
            if let Some(config) = backend.authenticate(headers).await {
                return Some(config);
            }
        }
        None
    }
}
