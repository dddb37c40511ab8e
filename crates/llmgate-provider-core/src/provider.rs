use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use llmgate_protocol::{CanonicalChunk, CanonicalRequest, CanonicalResponse};

use crate::context::RequestContext;
use crate::errors::{ProviderError, ProviderResult};

pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderResult<CanonicalChunk>> + Send>>;

/// One upstream LLM backend. `llmgate-provider-impl` supplies the
/// OpenAI-compatible and Bedrock implementations.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn call(
        &self,
        req: CanonicalRequest,
        ctx: &RequestContext,
    ) -> Result<CanonicalResponse, ProviderError>;

    async fn call_stream(
        &self,
        req: CanonicalRequest,
        ctx: &RequestContext,
    ) -> Result<ChunkStream, ProviderError>;
}
