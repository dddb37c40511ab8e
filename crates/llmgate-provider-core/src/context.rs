/// Per-request context threaded from the router down into a provider
/// adapter.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub trace_id: String,
    pub client_id: String,
    /// Credential to present upstream: the client's own, or the gateway
    /// default, resolved before the provider is ever called.
    pub upstream_api_key: Option<String>,
    pub upstream_base_url: Option<String>,
}
