//! Provider-agnostic request/response representation.
//!
//! Every wire format translates to and from these types; the router and the
//! fallback engine never see a provider-specific payload.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Which inbound API shape produced the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// `/chat/completions`
    Chat,
    /// legacy `/completions` with a `prompt`
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Self::System),
            "developer" => Some(Self::Developer),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Developer => "developer",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CanonicalMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
        }
    }
}

/// Sampling and length controls shared by all providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Remaining inbound fields, forwarded to OpenAI-compatible upstreams
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub kind: RequestKind,
    /// Alias requested by the caller
    pub model: String,
    pub messages: Vec<CanonicalMessage>,
    /// Only set for [`RequestKind::Text`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub params: GenerationParams,
    pub stream: bool,
    /// End-user identifier, consulted by quota signals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

impl CanonicalRequest {
    pub fn chat(model: impl Into<String>, messages: Vec<CanonicalMessage>) -> Self {
        Self {
            kind: RequestKind::Chat,
            model: model.into(),
            messages,
            prompt: None,
            params: GenerationParams::default(),
            stream: false,
            user: None,
        }
    }

    pub fn text(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            kind: RequestKind::Text,
            model: model.into(),
            messages: Vec::new(),
            prompt: Some(prompt.into()),
            params: GenerationParams::default(),
            stream: false,
            user: None,
        }
    }

    /// Messages as seen by chat-only providers: a text prompt becomes one user turn.
    pub fn conversation(&self) -> Vec<CanonicalMessage> {
        match (self.kind, &self.prompt) {
            (RequestKind::Text, Some(prompt)) => vec![CanonicalMessage::new(Role::User, prompt)],
            _ => self.messages.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChoice {
    pub index: u32,
    pub content: String,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalResponse {
    pub id: String,
    pub created: i64,
    /// Upstream model that produced the answer
    pub model: String,
    pub choices: Vec<CanonicalChoice>,
    pub usage: Option<Usage>,
}

impl CanonicalResponse {
    /// Single-choice response, mostly useful for adapters and tests.
    pub fn single(
        id: impl Into<String>,
        model: impl Into<String>,
        content: impl Into<String>,
        finish_reason: Option<&str>,
    ) -> Self {
        Self {
            id: id.into(),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            choices: vec![CanonicalChoice {
                index: 0,
                content: content.into(),
                finish_reason: finish_reason.map(str::to_string),
            }],
            usage: None,
        }
    }
}

/// One incremental piece of a streamed answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalChunk {
    pub id: Option<String>,
    pub index: u32,
    pub role: Option<Role>,
    pub content: Option<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl CanonicalChunk {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_roundtrip() {
        for role in ["system", "developer", "user", "assistant", "tool"] {
            assert_eq!(Role::parse(role).unwrap().as_str(), role);
        }
        assert!(Role::parse("narrator").is_none());
    }

    #[test]
    fn test_text_request_conversation() {
        let request = CanonicalRequest::text("gpt-4", "Say hi");
        let conversation = request.conversation();
        assert_eq!(conversation.len(), 1);
        assert_eq!(conversation[0].role, Role::User);
        assert_eq!(conversation[0].content, "Say hi");
    }

    #[test]
    fn test_usage_total() {
        let usage = Usage::new(10, 20);
        assert_eq!(usage.total_tokens, 30);
    }

    #[test]
    fn test_generation_params_flatten_extra() {
        let mut params = GenerationParams {
            temperature: Some(0.2),
            ..GenerationParams::default()
        };
        params
            .extra
            .insert("presence_penalty".to_string(), serde_json::json!(0.5));
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["temperature"], 0.2);
        assert_eq!(json["presence_penalty"], 0.5);
        assert!(json.get("max_tokens").is_none());
    }
}
