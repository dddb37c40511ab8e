use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_bedrockruntime::operation::converse::ConverseError;
use aws_sdk_bedrockruntime::operation::converse_stream::ConverseStreamError;
use aws_sdk_bedrockruntime::types as bedrock;
use aws_sdk_bedrockruntime::Client;
use llmgate_protocol::{sse, CanonicalChunk, CanonicalRequest, CanonicalResponse, Choice, Message, Role, Usage};
use llmgate_provider_core::{ChunkStream, Provider, ProviderError, RequestContext};
use tokio::sync::mpsc;

/// AWS Bedrock Converse adapter.
///
/// The AWS SDK is natively async; this adapter honors the gateway's
/// requirement of a synchronous provider client by driving every SDK call
/// to completion on a dedicated single-threaded runtime reached through
/// `spawn_blocking`, so the calling request task's own executor is never
/// blocked and the Bedrock client is used exactly the way a synchronous SDK
/// client would be.
pub struct BedrockProvider {
    client: Arc<Client>,
    worker: Arc<tokio::runtime::Runtime>,
}

impl BedrockProvider {
    pub async fn from_env() -> Result<Self, ProviderError> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let client = Client::new(&sdk_config);
        let worker = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ProviderError::Other(format!("start bedrock worker runtime: {err}")))?;
        Ok(Self {
            client: Arc::new(client),
            worker: Arc::new(worker),
        })
    }
}

fn to_bedrock_messages(req: &CanonicalRequest) -> Result<(Option<String>, Vec<bedrock::Message>), ProviderError> {
    let mut system = String::new();
    let mut messages = Vec::new();
    for m in &req.messages {
        match m.role {
            Role::System => {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&m.content);
            }
            Role::User | Role::Tool => {
                messages.push(
                    bedrock::Message::builder()
                        .role(bedrock::ConversationRole::User)
                        .content(bedrock::ContentBlock::Text(m.content.clone()))
                        .build()
                        .map_err(|err| ProviderError::Other(format!("build bedrock message: {err}")))?,
                );
            }
            Role::Assistant => {
                messages.push(
                    bedrock::Message::builder()
                        .role(bedrock::ConversationRole::Assistant)
                        .content(bedrock::ContentBlock::Text(m.content.clone()))
                        .build()
                        .map_err(|err| ProviderError::Other(format!("build bedrock message: {err}")))?,
                );
            }
        }
    }
    Ok((if system.is_empty() { None } else { Some(system) }, messages))
}

fn map_converse_error(err: aws_sdk_bedrockruntime::error::SdkError<ConverseError>) -> ProviderError {
    match err.into_service_error() {
        ConverseError::ThrottlingException(e) => ProviderError::Other(format!("throttled: {e:?}")),
        ConverseError::AccessDeniedException(e) => {
            ProviderError::Other(format!("access denied: {e:?}"))
        }
        other => ProviderError::Other(format!("bedrock converse failed: {other:?}")),
    }
}

fn map_converse_stream_error(
    err: aws_sdk_bedrockruntime::error::SdkError<ConverseStreamError>,
) -> ProviderError {
    match err.into_service_error() {
        ConverseStreamError::ThrottlingException(e) => {
            ProviderError::Other(format!("throttled: {e:?}"))
        }
        other => ProviderError::Other(format!("bedrock converse_stream failed: {other:?}")),
    }
}

fn now_epoch_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl Provider for BedrockProvider {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    async fn call(
        &self,
        req: CanonicalRequest,
        _ctx: &RequestContext,
    ) -> Result<CanonicalResponse, ProviderError> {
        let (system, messages) = to_bedrock_messages(&req)?;
        let client = self.client.clone();
        let model = req.model.clone();
        let worker = self.worker.clone();

        let (content, usage) = tokio::task::spawn_blocking(move || {
            worker.block_on(async move {
                let mut builder = client.converse().model_id(&model).set_messages(Some(messages));
                if let Some(system) = system {
                    builder = builder.system(bedrock::SystemContentBlock::Text(system));
                }
                let response = builder.send().await.map_err(map_converse_error)?;
                let content = match response.output {
                    Some(bedrock::ConverseOutput::Message(message)) => message
                        .content
                        .into_iter()
                        .filter_map(|block| match block {
                            bedrock::ContentBlock::Text(text) => Some(text),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join(""),
                    _ => return Err(ProviderError::Other("no output from bedrock".to_string())),
                };
                let usage = response.usage.map(|u| Usage {
                    prompt_tokens: u.input_tokens.max(0) as u32,
                    completion_tokens: u.output_tokens.max(0) as u32,
                    total_tokens: u.total_tokens.max(0) as u32,
                });
                Ok((content, usage))
            })
        })
        .await
        .map_err(|err| ProviderError::Other(format!("bedrock worker task panicked: {err}")))??;

        Ok(CanonicalResponse {
            id: format!("bedrock-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: now_epoch_secs(),
            model: req.model,
            choices: vec![Choice {
                index: 0,
                message: Message { role: Role::Assistant, content },
                finish_reason: Some("stop".to_string()),
            }],
            usage,
            extra: serde_json::Map::new(),
        })
    }

    async fn call_stream(
        &self,
        req: CanonicalRequest,
        _ctx: &RequestContext,
    ) -> Result<ChunkStream, ProviderError> {
        let (system, messages) = to_bedrock_messages(&req)?;
        let client = self.client.clone();
        let model = req.model.clone();
        let worker = self.worker.clone();
        let (tx, rx) = mpsc::channel::<Result<CanonicalChunk, ProviderError>>(64);

        std::thread::spawn(move || {
            worker.block_on(async move {
                let mut builder = client
                    .converse_stream()
                    .model_id(&model)
                    .set_messages(Some(messages));
                if let Some(system) = system {
                    builder = builder.system(bedrock::SystemContentBlock::Text(system));
                }
                let mut stream = match builder.send().await {
                    Ok(output) => output.stream,
                    Err(err) => {
                        let _ = tx.send(Err(map_converse_stream_error(err))).await;
                        return;
                    }
                };
                loop {
                    match stream.recv().await {
                        Ok(Some(bedrock::ConverseStreamOutput::ContentBlockDelta(delta))) => {
                            if let Some(bedrock::ContentBlockDelta::Text(text)) = delta.delta {
                                let raw = sse::encode_data_frame(
                                    &serde_json::json!({"choices":[{"delta":{"content": text}}]})
                                        .to_string(),
                                );
                                if tx.send(Ok(CanonicalChunk::Delta { text, raw })).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Some(bedrock::ConverseStreamOutput::MessageStop(stop))) => {
                            let finish_reason = match stop.stop_reason {
                                bedrock::StopReason::EndTurn => "stop",
                                bedrock::StopReason::MaxTokens => "length",
                                bedrock::StopReason::ContentFiltered
                                | bedrock::StopReason::GuardrailIntervened => "content_filter",
                                bedrock::StopReason::ToolUse => "tool_calls",
                                _ => "stop",
                            };
                            let raw = sse::encode_data_frame(
                                &serde_json::json!({
                                    "choices":[{"delta":{},"finish_reason": finish_reason}]
                                })
                                .to_string(),
                            );
                            if tx.send(Ok(CanonicalChunk::Event { raw })).await.is_err() {
                                return;
                            }
                        }
                        Ok(Some(_)) => continue,
                        Ok(None) => {
                            let _ = tx.send(Ok(CanonicalChunk::Done)).await;
                            return;
                        }
                        Err(err) => {
                            let _ = tx
                                .send(Err(ProviderError::Other(format!(
                                    "bedrock stream error: {err:?}"
                                ))))
                                .await;
                            return;
                        }
                    }
                }
            });
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

/// Defers constructing the real [`BedrockProvider`] (and loading
/// `aws-config`'s ambient credential chain) until the first Bedrock-routed
/// request actually arrives, so deployments that never select Bedrock never
/// pay for it.
pub struct LazyBedrockProvider {
    inner: tokio::sync::OnceCell<Result<BedrockProvider, String>>,
}

impl LazyBedrockProvider {
    pub fn new() -> Self {
        Self { inner: tokio::sync::OnceCell::new() }
    }

    async fn get(&self) -> Result<&BedrockProvider, ProviderError> {
        let result = self
            .inner
            .get_or_init(|| async { BedrockProvider::from_env().await.map_err(|e| e.to_string()) })
            .await;
        result.as_ref().map_err(|message| ProviderError::Other(message.clone()))
    }
}

impl Default for LazyBedrockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for LazyBedrockProvider {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    async fn call(
        &self,
        req: CanonicalRequest,
        ctx: &RequestContext,
    ) -> Result<CanonicalResponse, ProviderError> {
        self.get().await?.call(req, ctx).await
    }

    async fn call_stream(
        &self,
        req: CanonicalRequest,
        ctx: &RequestContext,
    ) -> Result<ChunkStream, ProviderError> {
        self.get().await?.call_stream(req, ctx).await
    }
}
