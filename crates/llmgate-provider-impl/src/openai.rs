use async_trait::async_trait;
use futures_util::StreamExt;
use llmgate_protocol::{sse, CanonicalChunk, CanonicalRequest, CanonicalResponse, SseParser};
use llmgate_provider_core::{ChunkStream, Provider, ProviderError, RequestContext};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible chat-completions adapter. Also serves any upstream
/// that speaks the same wire shape (Azure OpenAI, local OpenAI-compatible
/// servers) by pointing `UPSTREAM_BASE_URL` elsewhere.
pub struct OpenAiProvider {
    http: wreq::Client,
}

impl OpenAiProvider {
    pub fn new() -> Result<Self, wreq::Error> {
        Ok(Self {
            http: wreq::Client::builder()
                .connect_timeout(std::time::Duration::from_secs(10))
                .read_timeout(std::time::Duration::from_secs(120))
                .build()?,
        })
    }

    fn endpoint(&self, ctx: &RequestContext) -> String {
        let base = ctx
            .upstream_base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }

    fn build_request(
        &self,
        req: &CanonicalRequest,
        ctx: &RequestContext,
        stream: bool,
    ) -> Result<wreq::RequestBuilder, ProviderError> {
        let api_key = ctx
            .upstream_api_key
            .as_deref()
            .ok_or(ProviderError::MissingCredential("upstream_api_key"))?;

        let mut body = req.clone();
        body.stream = stream;
        let payload = serde_json::to_vec(&body)
            .map_err(|err| ProviderError::Other(format!("encode request body: {err}")))?;

        Ok(self
            .http
            .request(http::Method::POST, self.endpoint(ctx))
            .bearer_auth(api_key)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::ACCEPT, if stream { "text/event-stream" } else { "application/json" })
            .body(payload))
    }
}

/// Distinguishes a deadline elapsing from every other transport failure.
fn map_wreq_error(err: wreq::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout
    } else {
        ProviderError::Transport { message: err.to_string() }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn call(
        &self,
        req: CanonicalRequest,
        ctx: &RequestContext,
    ) -> Result<CanonicalResponse, ProviderError> {
        let builder = self.build_request(&req, ctx, false)?;
        let response = builder.send().await.map_err(map_wreq_error)?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ProviderError::Transport { message: err.to_string() })?;

        if !status.is_success() {
            return Err(ProviderError::UpstreamStatus { status, body });
        }

        serde_json::from_slice(&body)
            .map_err(|err| ProviderError::Other(format!("decode upstream response: {err}")))
    }

    async fn call_stream(
        &self,
        req: CanonicalRequest,
        ctx: &RequestContext,
    ) -> Result<ChunkStream, ProviderError> {
        let builder = self.build_request(&req, ctx, true)?;
        let response = builder.send().await.map_err(map_wreq_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .bytes()
                .await
                .map_err(|err| ProviderError::Transport { message: err.to_string() })?;
            return Err(ProviderError::UpstreamStatus { status, body });
        }

        let byte_stream = response.bytes_stream();
        let chunk_stream = futures_util::stream::unfold(
            (byte_stream, SseParser::new(), std::collections::VecDeque::new(), false),
            |(mut byte_stream, mut parser, mut pending, done)| async move {
                loop {
                    if let Some(event) = pending.pop_front() {
                        return Some((Ok(event_to_chunk(event)), (byte_stream, parser, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match byte_stream.next().await {
                        Some(Ok(bytes)) => {
                            pending.extend(parser.push_bytes(&bytes));
                        }
                        Some(Err(err)) => {
                            return Some((
                                Err(ProviderError::Transport { message: err.to_string() }),
                                (byte_stream, parser, pending, true),
                            ));
                        }
                        None => {
                            pending.extend(parser.finish());
                            if pending.is_empty() {
                                return None;
                            }
                        }
                    }
                }
            },
        );

        Ok(Box::pin(chunk_stream))
    }
}

/// Every SSE event the upstream sends is buffered and yielded one at a time,
/// so a single upstream read that contains several `data:` frames never
/// drops any of them.
fn event_to_chunk(event: sse::SseEvent) -> CanonicalChunk {
    if event.data == sse::DONE_PAYLOAD {
        return CanonicalChunk::Done;
    }
    let raw = sse::encode_data_frame(&event.data);
    match extract_delta_text(&event.data) {
        Some(text) if !text.is_empty() => CanonicalChunk::Delta { text, raw },
        _ => CanonicalChunk::Event { raw },
    }
}

fn extract_delta_text(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_delta_text_from_chunk_payload() {
        let payload = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        assert_eq!(extract_delta_text(payload), Some("hi".to_string()));
    }

    #[test]
    fn missing_delta_content_yields_none() {
        let payload = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(extract_delta_text(payload), None);
    }
}
