//! OpenAI-compatible wire format (`/chat/completions`, `/completions`).

use super::sse::SseEvent;
use super::{
    AdapterError, AdapterErrorKind, CanonicalChoice, CanonicalChunk, CanonicalRequest,
    CanonicalResponse, RequestKind, Role, StreamDecoder, StreamStep, Usage, WireFormat,
};
use crate::adapter::error::extract_error_message;
use crate::core::config::Credential;
use serde::Deserialize;
use serde_json::{json, Map, Value};

/// Keys the canonical request owns; inbound extras never override them.
const RESERVED_KEYS: &[&str] = &[
    "model",
    "messages",
    "prompt",
    "stream",
    "temperature",
    "max_tokens",
    "top_p",
    "stop",
    "user",
];

pub struct OpenAiWire;

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    message: Option<OpenAiMessage>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    delta: Option<OpenAiDelta>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl From<OpenAiUsage> for Usage {
    fn from(usage: OpenAiUsage) -> Self {
        Usage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

fn malformed(what: &str, err: impl std::fmt::Display) -> AdapterError {
    AdapterError::new(
        AdapterErrorKind::Unknown,
        format!("malformed upstream {}: {}", what, err),
    )
}

impl WireFormat for OpenAiWire {
    fn endpoint(&self, kind: RequestKind) -> &'static str {
        match kind {
            RequestKind::Chat => "/chat/completions",
            RequestKind::Text => "/completions",
        }
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        credential: &Credential,
    ) -> reqwest::RequestBuilder {
        builder.bearer_auth(credential.expose())
    }

    fn request_body(&self, model: &str, request: &CanonicalRequest, stream: bool) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), json!(model));

        match request.kind {
            RequestKind::Chat => {
                let messages: Vec<Value> = request
                    .messages
                    .iter()
                    .map(|m| {
                        let mut message = json!({"role": m.role.as_str(), "content": m.content});
                        if let Some(ref name) = m.name {
                            message["name"] = json!(name);
                        }
                        message
                    })
                    .collect();
                body.insert("messages".to_string(), Value::Array(messages));
            }
            RequestKind::Text => {
                body.insert(
                    "prompt".to_string(),
                    json!(request.prompt.as_deref().unwrap_or_default()),
                );
            }
        }

        let params = &request.params;
        if let Some(temperature) = params.temperature {
            body.insert("temperature".to_string(), json!(temperature));
        }
        if let Some(max_tokens) = params.max_tokens {
            body.insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(top_p) = params.top_p {
            body.insert("top_p".to_string(), json!(top_p));
        }
        if let Some(ref stop) = params.stop {
            body.insert("stop".to_string(), json!(stop));
        }
        if let Some(ref user) = request.user {
            body.insert("user".to_string(), json!(user));
        }
        for (key, value) in &params.extra {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                body.insert(key.clone(), value.clone());
            }
        }
        body.insert("stream".to_string(), json!(stream));

        Value::Object(body)
    }

    fn parse_response(
        &self,
        _kind: RequestKind,
        body: Value,
    ) -> Result<CanonicalResponse, AdapterError> {
        let response: OpenAiResponse =
            serde_json::from_value(body).map_err(|e| malformed("response", e))?;

        let choices = response
            .choices
            .into_iter()
            .map(|choice| CanonicalChoice {
                index: choice.index,
                content: choice
                    .message
                    .and_then(|m| m.content)
                    .or(choice.text)
                    .unwrap_or_default(),
                finish_reason: choice.finish_reason,
            })
            .collect();

        Ok(CanonicalResponse {
            id: response
                .id
                .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4())),
            created: response
                .created
                .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            model: response.model.unwrap_or_default(),
            choices,
            usage: response.usage.map(Usage::from),
        })
    }

    fn stream_decoder(&self, _kind: RequestKind) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder)
    }
}

/// `data:` lines carrying chunk objects, terminated by `[DONE]`.
struct OpenAiStreamDecoder;

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, event: &SseEvent) -> Result<StreamStep, AdapterError> {
        let data = match event.data.as_deref() {
            Some(data) => data.trim(),
            None => return Ok(StreamStep::Chunks(Vec::new())),
        };
        if data == "[DONE]" {
            return Ok(StreamStep::Done);
        }
        if data.is_empty() {
            return Ok(StreamStep::Chunks(Vec::new()));
        }

        let value: Value = serde_json::from_str(data).map_err(|e| malformed("stream event", e))?;
        if value.get("error").is_some() {
            let message =
                extract_error_message(&value).unwrap_or_else(|| "upstream stream error".into());
            return Err(AdapterError::new(AdapterErrorKind::ServerError, message));
        }

        let chunk: OpenAiStreamChunk =
            serde_json::from_value(value).map_err(|e| malformed("stream event", e))?;

        let mut chunks: Vec<CanonicalChunk> = chunk
            .choices
            .into_iter()
            .map(|choice| {
                let (role, content) = match choice.delta {
                    Some(delta) => (delta.role.as_deref().and_then(Role::parse), delta.content),
                    None => (None, choice.text),
                };
                CanonicalChunk {
                    id: chunk.id.clone(),
                    index: choice.index,
                    role,
                    content,
                    finish_reason: choice.finish_reason,
                    usage: None,
                }
            })
            .collect();

        if let Some(usage) = chunk.usage {
            match chunks.last_mut() {
                Some(last) => last.usage = Some(usage.into()),
                None => chunks.push(CanonicalChunk {
                    id: chunk.id,
                    usage: Some(usage.into()),
                    ..CanonicalChunk::default()
                }),
            }
        }

        Ok(StreamStep::Chunks(chunks))
    }
}
