use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use llmgate_clients::{ChainedStore, ClientConfig, ClientStore, LegacyFlatStore, RemoteTableStore, StaticJsonStore};
use llmgate_common::{ClientStoreBackendKind, GatewayConfig, PiiAction};
use llmgate_core::{AuditRecorder, FileSink, GatewayPipeline, StdoutSink};
use llmgate_provider_core::ProviderRegistry;
use llmgate_provider_impl::{LazyBedrockProvider, OpenAiProvider};
use llmgate_ratelimit::RateLimiter;

/// One field per gateway environment variable: every field accepts either a
/// flag or its environment variable, and is resolved to a typed default
/// afterward — core code never touches `std::env` directly.
#[derive(Debug, Clone, Parser)]
#[command(name = "llmgate", version, about = "Security-enforcing reverse proxy for LLM provider APIs")]
struct CliArgs {
    #[arg(long, env = "GATEWAY_HOST")]
    host: Option<String>,

    #[arg(long, env = "GATEWAY_PORT")]
    port: Option<String>,

    /// `GATEWAY_API_KEYS` — comma-separated legacy keys.
    #[arg(long, env = "GATEWAY_API_KEYS")]
    gateway_api_keys: Option<String>,

    /// `UPSTREAM_BASE_URL`
    #[arg(long, env = "UPSTREAM_BASE_URL")]
    upstream_base_url: Option<String>,

    /// `UPSTREAM_API_KEY`
    #[arg(long, env = "UPSTREAM_API_KEY")]
    upstream_api_key: Option<String>,

    /// `INJECTION_THRESHOLD`
    #[arg(long, env = "INJECTION_THRESHOLD")]
    injection_threshold: Option<String>,

    /// `PII_ACTION`
    #[arg(long, env = "PII_ACTION")]
    pii_action: Option<String>,

    /// `RESPONSE_PII_ACTION`
    #[arg(long, env = "RESPONSE_PII_ACTION")]
    response_pii_action: Option<String>,

    /// `RATE_LIMIT_RPM`
    #[arg(long, env = "RATE_LIMIT_RPM")]
    rate_limit_rpm: Option<String>,

    /// `CLIENT_STORE_BACKEND`
    #[arg(long, env = "CLIENT_STORE_BACKEND")]
    client_store_backend: Option<String>,

    /// `CLIENT_CONFIG_PATH` — a file path for the `json` backend, or the
    /// base URL of the remote table service for the `remote-table` backend.
    #[arg(long, env = "CLIENT_CONFIG_PATH")]
    client_config_path: Option<String>,

    /// `LOG_LEVEL`
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// `AUDIT_LOG_FILE`
    #[arg(long, env = "AUDIT_LOG_FILE")]
    audit_log_file: Option<String>,
}

fn build_config(args: &CliArgs) -> anyhow::Result<GatewayConfig> {
    let defaults = GatewayConfig::default();

    let legacy_api_keys = match &args.gateway_api_keys {
        Some(raw) => raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
        None => defaults.legacy_api_keys,
    };

    let injection_threshold = match &args.injection_threshold {
        Some(raw) => raw.parse::<f64>().context("INJECTION_THRESHOLD must be a float")?,
        None => defaults.injection_threshold,
    };

    let pii_action = match &args.pii_action {
        Some(raw) => raw.parse::<PiiAction>().context("invalid PII_ACTION")?,
        None => defaults.pii_action,
    };

    let response_pii_action = match &args.response_pii_action {
        Some(raw) => raw.parse::<PiiAction>().context("invalid RESPONSE_PII_ACTION")?,
        None => defaults.response_pii_action,
    };

    let rate_limit_rpm = match &args.rate_limit_rpm {
        Some(raw) => raw.parse::<u32>().context("RATE_LIMIT_RPM must be a positive integer")?,
        None => defaults.rate_limit_rpm,
    };

    let client_store_backend = match &args.client_store_backend {
        Some(raw) => raw.parse::<ClientStoreBackendKind>().context("invalid CLIENT_STORE_BACKEND")?,
        None => defaults.client_store_backend,
    };

    let port = match &args.port {
        Some(raw) => raw.parse::<u16>().context("GATEWAY_PORT must be a valid port number")?,
        None => defaults.port,
    };

    Ok(GatewayConfig {
        host: args.host.clone().unwrap_or(defaults.host),
        port,
        legacy_api_keys,
        upstream_base_url: args.upstream_base_url.clone().unwrap_or(defaults.upstream_base_url),
        upstream_api_key: args.upstream_api_key.clone().or(defaults.upstream_api_key),
        injection_threshold,
        pii_action,
        response_pii_action,
        rate_limit_rpm,
        client_store_backend,
        client_config_path: args.client_config_path.clone().unwrap_or(defaults.client_config_path),
        log_level: args.log_level.clone().unwrap_or(defaults.log_level),
        audit_log_file: args.audit_log_file.clone().or(defaults.audit_log_file),
        streaming_supported: defaults.streaming_supported,
    })
}

/// One record of the static client config document.
#[derive(Debug, serde::Deserialize)]
struct ClientRecord {
    client_id: String,
    api_key: String,
    #[serde(default)]
    rate_limit_rpm: Option<u32>,
    #[serde(default)]
    allowed_models: Vec<String>,
    #[serde(default)]
    provider: Option<llmgate_common::ProviderTag>,
    #[serde(default)]
    upstream_credential: Option<String>,
}

async fn build_client_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn ClientStore>> {
    let legacy = Arc::new(LegacyFlatStore::from_keys(&config.legacy_api_keys));

    let backend: Arc<dyn ClientStore> = match config.client_store_backend {
        ClientStoreBackendKind::Json => {
            let document = match tokio::fs::read_to_string(&config.client_config_path).await {
                Ok(raw) => raw,
                Err(error) => {
                    tracing::warn!(
                        path = %config.client_config_path,
                        %error,
                        "client config file unreadable, falling back to legacy keys only"
                    );
                    return Ok(legacy);
                }
            };
            let records: Vec<ClientRecord> =
                serde_json::from_str(&document).context("parsing CLIENT_CONFIG_PATH document")?;
            let mut table = HashMap::with_capacity(records.len());
            for record in records {
                table.insert(
                    record.api_key,
                    ClientConfig {
                        client_id: record.client_id,
                        allowed_models: record.allowed_models,
                        provider: record.provider.unwrap_or(llmgate_common::ProviderTag::OpenAi),
                        rate_limit_rpm: record.rate_limit_rpm,
                        upstream_api_key: record.upstream_credential,
                    },
                );
            }
            Arc::new(StaticJsonStore::from_document(table))
        }
        ClientStoreBackendKind::RemoteTable => {
            Arc::new(RemoteTableStore::new(config.client_config_path.clone()).context("building remote client table store")?)
        }
    };

    Ok(Arc::new(ChainedStore::new(vec![legacy, backend])))
}

fn build_provider_registry(config: &GatewayConfig) -> anyhow::Result<Arc<ProviderRegistry>> {
    let mut registry = ProviderRegistry::new();
    let openai = OpenAiProvider::new().context("building OpenAI client")?;
    registry.register(llmgate_common::ProviderTag::OpenAi, Arc::new(openai));
    registry.register(llmgate_common::ProviderTag::Bedrock, Arc::new(LazyBedrockProvider::new()));
    let _ = &config.upstream_base_url;
    Ok(Arc::new(registry))
}

async fn build_audit_recorder(config: &GatewayConfig) -> anyhow::Result<AuditRecorder> {
    let recorder = AuditRecorder::new();
    match &config.audit_log_file {
        Some(path) => {
            let sink = FileSink::open(path).await.with_context(|| format!("opening audit log file {path}"))?;
            recorder.add_sink(Arc::new(sink)).await;
        }
        None => {
            recorder.add_sink(Arc::new(StdoutSink)).await;
        }
    }
    Ok(recorder)
}

/// Sweeps idle rate-limit buckets so a long-running deployment doesn't
/// accumulate one bucket per client forever.
fn spawn_rate_limiter_eviction(limiter: Arc<RateLimiter>) {
    tokio::spawn(async move {
        let idle_timeout = Duration::from_secs(600);
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            let evicted = limiter.evict_idle(idle_timeout);
            if evicted > 0 {
                tracing::debug!(evicted, "rate limiter evicted idle buckets");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = CliArgs::parse();
    let config = build_config(&args)?;

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        host = %config.host,
        port = config.port,
        upstream_base_url = %config.upstream_base_url,
        pii_action = %config.pii_action,
        response_pii_action = %config.response_pii_action,
        client_store_backend = ?config.client_store_backend,
        "llmgate starting"
    );

    let client_store = build_client_store(&config).await?;
    let rate_limiter = Arc::new(RateLimiter::new());
    let registry = build_provider_registry(&config)?;
    let audit = build_audit_recorder(&config).await?;

    spawn_rate_limiter_eviction(rate_limiter.clone());

    let pipeline = Arc::new(GatewayPipeline::new(&config, client_store, rate_limiter, registry, audit));
    let app = llmgate_router::router(pipeline);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await.with_context(|| format!("binding {bind}"))?;
    tracing::info!(%bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}
