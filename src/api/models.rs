//! API request and response models.
//!
//! Wire shapes of the OpenAI-compatible surface plus the operational
//! endpoints. Canonical adapter types are rendered into these at the edge,
//! with `model` rewritten to the alias the caller asked for.

use crate::adapter::{CanonicalChunk, CanonicalResponse, RequestKind};
use crate::services::DeploymentHealth;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use utoipa::ToSchema;

/// Chat completion request following OpenAI API format.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "model": "gpt-4",
    "messages": [
        {"role": "system", "content": "You are a helpful assistant."},
        {"role": "user", "content": "Hello!"}
    ],
    "temperature": 0.7,
    "max_tokens": 1000,
    "stream": false
}))]
pub struct ChatCompletionRequest {
    /// Model alias
    pub model: String,

    /// Conversation messages
    pub messages: Vec<Message>,

    /// Sampling temperature (0.0 to 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Nucleus sampling (0.0 to 1.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,

    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Whether to stream the response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// End-user identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Additional provider-specific parameters
    #[serde(flatten)]
    #[schema(additional_properties)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Legacy text completion request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"model": "gpt-4", "prompt": "Once upon a time", "max_tokens": 32}))]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"role": "user", "content": "Hello!"}))]
pub struct Message {
    /// Role: "system", "developer", "user", "assistant" or "tool"
    pub role: String,

    /// Message content
    pub content: String,
}

/// Chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "id": "chatcmpl-abc123",
    "object": "chat.completion",
    "created": 1677858242,
    "model": "gpt-4",
    "choices": [{
        "index": 0,
        "message": {"role": "assistant", "content": "Hello! How can I help you today?"},
        "finish_reason": "stop"
    }],
    "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
}))]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

/// Legacy text completion response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TextCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<TextChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TextChoice {
    pub index: u32,
    pub text: String,
    pub finish_reason: Option<String>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl From<&crate::adapter::Usage> for Usage {
    fn from(usage: &crate::adapter::Usage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// One `chat.completion.chunk` SSE event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Render a canonical answer in the shape matching the inbound endpoint.
pub fn render_response(
    kind: RequestKind,
    alias: &str,
    response: CanonicalResponse,
) -> serde_json::Value {
    let usage = response.usage.as_ref().map(Usage::from);
    let rendered = match kind {
        RequestKind::Chat => serde_json::to_value(ChatCompletionResponse {
            id: response.id,
            object: "chat.completion".to_string(),
            created: response.created,
            model: alias.to_string(),
            choices: response
                .choices
                .into_iter()
                .map(|choice| Choice {
                    index: choice.index,
                    message: Message {
                        role: "assistant".to_string(),
                        content: choice.content,
                    },
                    finish_reason: choice.finish_reason,
                })
                .collect(),
            usage,
        }),
        RequestKind::Text => serde_json::to_value(TextCompletionResponse {
            id: response.id,
            object: "text_completion".to_string(),
            created: response.created,
            model: alias.to_string(),
            choices: response
                .choices
                .into_iter()
                .map(|choice| TextChoice {
                    index: choice.index,
                    text: choice.content,
                    finish_reason: choice.finish_reason,
                })
                .collect(),
            usage,
        }),
    };
    rendered.unwrap_or_default()
}

/// Render one streamed chunk; `id` and `created` stay fixed for the stream.
pub fn render_chunk(
    kind: RequestKind,
    id: &str,
    created: i64,
    alias: &str,
    chunk: &CanonicalChunk,
) -> serde_json::Value {
    let usage = chunk.usage.as_ref().map(Usage::from);
    let rendered = match kind {
        RequestKind::Chat => serde_json::to_value(ChatCompletionChunk {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: alias.to_string(),
            choices: vec![ChunkChoice {
                index: chunk.index,
                delta: Delta {
                    role: chunk.role.map(|r| r.as_str().to_string()),
                    content: chunk.content.clone(),
                },
                finish_reason: chunk.finish_reason.clone(),
            }],
            usage,
        }),
        RequestKind::Text => serde_json::to_value(TextCompletionResponse {
            id: id.to_string(),
            object: "text_completion".to_string(),
            created,
            model: alias.to_string(),
            choices: vec![TextChoice {
                index: chunk.index,
                text: chunk.content.clone().unwrap_or_default(),
                finish_reason: chunk.finish_reason.clone(),
            }],
            usage,
        }),
    };
    rendered.unwrap_or_default()
}

/// List of available models.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "object": "list",
    "data": [{"id": "gpt-4", "object": "model", "created": 1677610602, "owned_by": "llm-router"}]
}))]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Alias with its deployments, credentials omitted.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AliasInfo {
    pub model_name: String,
    pub deployments: Vec<DeploymentInfo>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeploymentInfo {
    pub id: String,
    pub provider: String,
    pub api_base: String,
    pub model: String,
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_second: Option<u32>,
    pub circuit_state: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelInfoResponse {
    pub data: Vec<AliasInfo>,
}

/// Liveness response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"status": "ok", "aliases": 2, "deployments": 5}))]
pub struct HealthResponse {
    pub status: String,
    pub aliases: usize,
    pub deployments: usize,
}

/// Health tracker snapshot.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeploymentHealthResponse {
    pub deployments: Vec<DeploymentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ReloadResponse {
    pub status: String,
    pub aliases: usize,
    pub deployments: usize,
}

/// API error response format.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": {
        "message": "Missing required parameter: 'messages'",
        "type": "invalid_request_error",
        "param": "messages",
        "code": null
    }
}))]
pub struct ApiErrorResponse {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::Role;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_render_chat_response_rewrites_model() {
        let mut response =
            CanonicalResponse::single("chatcmpl-1", "gpt-4-0613", "Hello!", Some("stop"));
        response.created = 1_700_000_000;
        response.usage = Some(crate::adapter::Usage::new(3, 2));

        let value = render_response(RequestKind::Chat, "gpt-4", response);
        assert_eq!(
            value,
            json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1_700_000_000,
                "model": "gpt-4",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })
        );
    }

    #[test]
    fn test_render_text_response() {
        let response = CanonicalResponse::single("cmpl-1", "davinci", "there", None);
        let value = render_response(RequestKind::Text, "text-alias", response);
        assert_eq!(value["object"], "text_completion");
        assert_eq!(value["model"], "text-alias");
        assert_eq!(value["choices"][0]["text"], "there");
        assert!(value.get("usage").is_none());
    }

    #[test]
    fn test_render_chunk() {
        let chunk = CanonicalChunk {
            role: Some(Role::Assistant),
            content: Some("Hi".to_string()),
            ..CanonicalChunk::default()
        };
        let value = render_chunk(RequestKind::Chat, "chatcmpl-9", 42, "gpt-4", &chunk);
        assert_eq!(value["object"], "chat.completion.chunk");
        assert_eq!(value["model"], "gpt-4");
        assert_eq!(value["choices"][0]["delta"], json!({"role": "assistant", "content": "Hi"}));
        assert_eq!(value["choices"][0]["finish_reason"], serde_json::Value::Null);

        let value = render_chunk(RequestKind::Text, "cmpl-9", 42, "gpt-4", &chunk);
        assert_eq!(value["object"], "text_completion");
        assert_eq!(value["choices"][0]["text"], "Hi");
    }
}
