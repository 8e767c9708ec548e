//! Anthropic Messages API wire format.
//!
//! System turns are lifted into the top-level `system` field, text prompts
//! become a single user turn and `max_tokens` is always sent because the
//! API requires it. Stop reasons are reported using OpenAI finish reasons.

use super::sse::SseEvent;
use super::{
    AdapterError, AdapterErrorKind, CanonicalChoice, CanonicalChunk, CanonicalRequest,
    CanonicalResponse, RequestKind, Role, StreamDecoder, StreamStep, Usage, WireFormat,
};
use crate::core::config::Credential;
use serde::Deserialize;
use serde_json::{json, Value};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicWire;

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    #[serde(default)]
    model: String,
    content: Vec<AnthropicContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicStreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: AnthropicStreamMessage },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: AnthropicDelta },
    #[serde(rename = "message_delta")]
    MessageDelta {
        delta: AnthropicMessageDelta,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "error")]
    Error { error: AnthropicErrorBody },
    /// ping, content_block_start, content_block_stop
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    id: String,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

/// Map an Anthropic stop reason onto the OpenAI finish reason vocabulary.
pub fn finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        _ => "stop",
    }
}

fn error_kind(error_type: &str) -> AdapterErrorKind {
    match error_type {
        "authentication_error" | "permission_error" => AdapterErrorKind::Auth,
        "rate_limit_error" => AdapterErrorKind::RateLimit,
        "invalid_request_error" | "not_found_error" | "request_too_large" => {
            AdapterErrorKind::InvalidRequest
        }
        "api_error" | "overloaded_error" => AdapterErrorKind::ServerError,
        "timeout_error" => AdapterErrorKind::Timeout,
        _ => AdapterErrorKind::Unknown,
    }
}

fn malformed(what: &str, err: impl std::fmt::Display) -> AdapterError {
    AdapterError::new(
        AdapterErrorKind::Unknown,
        format!("malformed upstream {}: {}", what, err),
    )
}

impl WireFormat for AnthropicWire {
    fn endpoint(&self, _kind: RequestKind) -> &'static str {
        "/v1/messages"
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        credential: &Credential,
    ) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", credential.expose())
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn request_body(&self, model: &str, request: &CanonicalRequest, stream: bool) -> Value {
        let mut system = Vec::new();
        let mut messages = Vec::new();

        for message in request.conversation() {
            match message.role {
                Role::System | Role::Developer => system.push(message.content),
                Role::Assistant => {
                    messages.push(json!({"role": "assistant", "content": message.content}))
                }
                Role::User | Role::Tool => {
                    messages.push(json!({"role": "user", "content": message.content}))
                }
            }
        }

        let params = &request.params;
        let mut body = json!({
            "model": model,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
        });

        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = params.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(top_p) = params.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(ref stop) = params.stop {
            body["stop_sequences"] = json!(stop);
        }
        if let Some(ref user) = request.user {
            body["metadata"] = json!({"user_id": user});
        }
        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    fn parse_response(
        &self,
        _kind: RequestKind,
        body: Value,
    ) -> Result<CanonicalResponse, AdapterError> {
        let response: AnthropicResponse =
            serde_json::from_value(body).map_err(|e| malformed("response", e))?;

        let content: String = response
            .content
            .iter()
            .filter_map(|block| match block {
                AnthropicContentBlock::Text { text } => Some(text.as_str()),
                AnthropicContentBlock::Other => None,
            })
            .collect();

        Ok(CanonicalResponse {
            id: response.id,
            created: chrono::Utc::now().timestamp(),
            model: response.model,
            choices: vec![CanonicalChoice {
                index: 0,
                content,
                finish_reason: response
                    .stop_reason
                    .as_deref()
                    .map(|r| finish_reason(r).to_string()),
            }],
            usage: response
                .usage
                .map(|u| Usage::new(u.input_tokens, u.output_tokens)),
        })
    }

    fn stream_decoder(&self, _kind: RequestKind) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder::default())
    }
}

/// Carries the message id and prompt token count from `message_start`
/// to the later events that need them.
#[derive(Default)]
struct AnthropicStreamDecoder {
    id: Option<String>,
    input_tokens: u32,
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<StreamStep, AdapterError> {
        let data = match event.data.as_deref() {
            Some(data) if !data.trim().is_empty() => data,
            _ => return Ok(StreamStep::Chunks(Vec::new())),
        };

        let parsed: AnthropicStreamEvent =
            serde_json::from_str(data).map_err(|e| malformed("stream event", e))?;

        let chunk = match parsed {
            AnthropicStreamEvent::MessageStart { message } => {
                self.id = Some(message.id);
                self.input_tokens = message.usage.map(|u| u.input_tokens).unwrap_or(0);
                CanonicalChunk {
                    id: self.id.clone(),
                    role: Some(Role::Assistant),
                    ..CanonicalChunk::default()
                }
            }
            AnthropicStreamEvent::ContentBlockDelta { delta } => match delta {
                AnthropicDelta::TextDelta { text } => CanonicalChunk {
                    id: self.id.clone(),
                    content: Some(text),
                    ..CanonicalChunk::default()
                },
                AnthropicDelta::Other => return Ok(StreamStep::Chunks(Vec::new())),
            },
            AnthropicStreamEvent::MessageDelta { delta, usage } => CanonicalChunk {
                id: self.id.clone(),
                finish_reason: delta
                    .stop_reason
                    .as_deref()
                    .map(|r| finish_reason(r).to_string()),
                usage: usage.map(|u| Usage::new(self.input_tokens, u.output_tokens)),
                ..CanonicalChunk::default()
            },
            AnthropicStreamEvent::MessageStop => return Ok(StreamStep::Done),
            AnthropicStreamEvent::Error { error } => {
                return Err(AdapterError::new(error_kind(&error.error_type), error.message));
            }
            AnthropicStreamEvent::Ignored => return Ok(StreamStep::Chunks(Vec::new())),
        };

        Ok(StreamStep::Chunks(vec![chunk]))
    }
}
