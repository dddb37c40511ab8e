use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `{role}` in an OpenAI chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    /// Whether this role's content counts as user-provided input for the
    /// injection scorer.
    pub fn is_user_provided(self) -> bool {
        matches!(self, Role::User | Role::Tool)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// The OpenAI chat-completion request shape used internally.
///
/// `extra` captures every request field this gateway doesn't care about
/// (temperature, max_tokens, tool definitions, ...) so they pass through to
/// the upstream provider untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CanonicalRequestError {
    #[error("messages must not be empty")]
    EmptyMessages,
}

impl CanonicalRequest {
    /// Concatenation of all user-provided text, lowercased, for the
    /// injection scorer.
    pub fn user_provided_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| m.role.is_user_provided())
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn validate(&self) -> Result<(), CanonicalRequestError> {
        if self.messages.is_empty() {
            return Err(CanonicalRequestError::EmptyMessages);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Non-streaming reply in OpenAI shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanonicalResponse {
    /// Concatenation of all choice content, used for response-side scanning.
    pub fn combined_text(&self) -> String {
        self.choices
            .iter()
            .map(|c| c.message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn with_combined_content(&self, text: &str) -> CanonicalResponse {
        let mut out = self.clone();
        if let Some(choice) = out.choices.first_mut() {
            choice.message.content = text.to_string();
        }
        for choice in out.choices.iter_mut().skip(1) {
            choice.message.content.clear();
        }
        out
    }
}

/// One streaming event. Adapters produce these; the stream coordinator
/// doesn't interpret provider wire format, it only needs the accumulated
/// text (for scanning) and the raw bytes to forward unchanged.
#[derive(Debug, Clone)]
pub enum CanonicalChunk {
    /// A content delta. `text` feeds the accumulator/scanners; `raw` is the
    /// exact bytes forwarded to the client (an SSE `data: ...\n\n` frame).
    Delta { text: String, raw: Bytes },
    /// A non-content event (role marker, finish reason, ...) forwarded
    /// verbatim; nothing is added to the accumulator.
    Event { raw: Bytes },
    /// The terminal sentinel. The stream coordinator holds this until the
    /// response-side scan completes.
    Done,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_provided_text_excludes_system_and_assistant() {
        let req = CanonicalRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                Message { role: Role::System, content: "sys".to_string() },
                Message { role: Role::User, content: "hello".to_string() },
                Message { role: Role::Assistant, content: "reply".to_string() },
                Message { role: Role::Tool, content: "tool output".to_string() },
            ],
            stream: false,
            extra: Map::new(),
        };
        let text = req.user_provided_text();
        assert!(text.contains("hello"));
        assert!(text.contains("tool output"));
        assert!(!text.contains("sys"));
        assert!(!text.contains("reply"));
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let req = CanonicalRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![],
            stream: false,
            extra: Map::new(),
        };
        assert_eq!(req.validate(), Err(CanonicalRequestError::EmptyMessages));
    }

    #[test]
    fn extra_fields_round_trip() {
        let json = serde_json::json!({
            "model": "gpt-4o-mini",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "max_tokens": 128
        });
        let req: CanonicalRequest = serde_json::from_value(json).unwrap();
        assert_eq!(req.extra.get("temperature").unwrap(), 0.2);
        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back.get("max_tokens").unwrap(), 128);
    }
}
