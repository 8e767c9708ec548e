//! Inbound request validation.
//!
//! Bodies are parsed from raw bytes so that every malformed input maps to a
//! [`ValidationError`] in the OpenAI error shape instead of an extractor
//! rejection. Nothing here touches routing state except the alias lookup.

use crate::adapter::{CanonicalMessage, CanonicalRequest, GenerationParams, RequestKind, Role};
use crate::core::error::ValidationError;
use crate::services::routed_request::RoutedRequest;
use crate::services::routing_table::RoutingTable;
use serde_json::{Map, Value};

/// Fields interpreted by the gateway; everything else is passed through.
const KNOWN_FIELDS: &[&str] = &[
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

/// Parse and validate a chat or text completion body.
pub fn parse_request(kind: RequestKind, body: &[u8]) -> Result<CanonicalRequest, ValidationError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
    let Value::Object(mut object) = value else {
        return Err(ValidationError::MalformedJson(
            "request body must be a JSON object".to_string(),
        ));
    };

    let model = match object.get("model") {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("model")),
        Some(Value::String(model)) if !model.trim().is_empty() => model.clone(),
        Some(_) => return Err(ValidationError::invalid("model", "must be a non-empty string")),
    };

    let mut request = match kind {
        RequestKind::Chat => CanonicalRequest::chat(model, parse_messages(object.get("messages"))?),
        RequestKind::Text => CanonicalRequest::text(model, parse_prompt(object.get("prompt"))?),
    };

    request.stream = match object.get("stream") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(stream)) => *stream,
        Some(_) => return Err(ValidationError::invalid("stream", "must be a boolean")),
    };

    request.user = match object.get("user") {
        None | Some(Value::Null) => None,
        Some(Value::String(user)) => Some(user.clone()),
        Some(_) => return Err(ValidationError::invalid("user", "must be a string")),
    };

    request.params = GenerationParams {
        temperature: parse_ranged(&object, "temperature", 0.0, 2.0)?,
        top_p: parse_ranged(&object, "top_p", 0.0, 1.0)?,
        max_tokens: parse_max_tokens(object.get("max_tokens"))?,
        stop: parse_stop(object.get("stop"))?,
        extra: Map::new(),
    };

    object.retain(|key, _| !KNOWN_FIELDS.contains(&key.as_str()));
    request.params.extra = object;

    Ok(request)
}

/// Validate `body` and wrap it for the fallback engine. Unknown aliases are
/// rejected here, before any routing happens.
pub fn build_routed_request(
    table: &RoutingTable,
    kind: RequestKind,
    body: &[u8],
    request_id: &str,
) -> Result<RoutedRequest, ValidationError> {
    let request = parse_request(kind, body)?;
    if !table.contains(&request.model) {
        return Err(ValidationError::UnknownModel(request.model));
    }
    Ok(RoutedRequest::new(request_id, request))
}

fn parse_messages(value: Option<&Value>) -> Result<Vec<CanonicalMessage>, ValidationError> {
    let items = match value {
        None | Some(Value::Null) => return Err(ValidationError::MissingField("messages")),
        Some(Value::Array(items)) => items,
        Some(_) => return Err(ValidationError::invalid("messages", "must be an array")),
    };
    if items.is_empty() {
        return Err(ValidationError::invalid(
            "messages",
            "must contain at least one message",
        ));
    }

    items
        .iter()
        .enumerate()
        .map(|(index, item)| parse_message(index, item))
        .collect()
}

fn parse_message(index: usize, item: &Value) -> Result<CanonicalMessage, ValidationError> {
    let invalid = |reason: String| ValidationError::invalid("messages", reason);

    let object = item
        .as_object()
        .ok_or_else(|| invalid(format!("message {} must be an object", index)))?;

    let role = match object.get("role") {
        Some(Value::String(role)) => Role::parse(role)
            .ok_or_else(|| invalid(format!("message {} has unknown role '{}'", index, role)))?,
        _ => return Err(invalid(format!("message {} is missing 'role'", index))),
    };

    let content = match object.get("content") {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => join_text_parts(parts)
            .ok_or_else(|| invalid(format!("message {} has unsupported content parts", index)))?,
        // assistant turns that only carried tool calls
        None | Some(Value::Null) if role == Role::Assistant => String::new(),
        _ => {
            return Err(invalid(format!(
                "message {} content must be a string or an array of text parts",
                index
            )))
        }
    };

    let name = match object.get("name") {
        None | Some(Value::Null) => None,
        Some(Value::String(name)) => Some(name.clone()),
        Some(_) => return Err(invalid(format!("message {} name must be a string", index))),
    };

    Ok(CanonicalMessage {
        role,
        content,
        name,
    })
}

/// `[{"type": "text", "text": ...}, ...]` → concatenated text.
fn join_text_parts(parts: &[Value]) -> Option<String> {
    let mut text = String::new();
    for part in parts {
        if part.get("type").and_then(Value::as_str) != Some("text") {
            return None;
        }
        text.push_str(part.get("text")?.as_str()?);
    }
    Some(text)
}

fn parse_prompt(value: Option<&Value>) -> Result<String, ValidationError> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::MissingField("prompt")),
        Some(Value::String(prompt)) if !prompt.is_empty() => Ok(prompt.clone()),
        Some(Value::Array(items)) if items.len() == 1 => match &items[0] {
            Value::String(prompt) if !prompt.is_empty() => Ok(prompt.clone()),
            _ => Err(ValidationError::invalid("prompt", "must be a non-empty string")),
        },
        Some(_) => Err(ValidationError::invalid("prompt", "must be a non-empty string")),
    }
}

fn parse_ranged(
    object: &Map<String, Value>,
    field: &'static str,
    min: f64,
    max: f64,
) -> Result<Option<f64>, ValidationError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => match number.as_f64() {
            Some(v) if (min..=max).contains(&v) => Ok(Some(v)),
            _ => Err(ValidationError::invalid(
                field,
                format!("must be between {} and {}", min, max),
            )),
        },
        Some(_) => Err(ValidationError::invalid(field, "must be a number")),
    }
}

fn parse_max_tokens(value: Option<&Value>) -> Result<Option<u32>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(number)) => match number.as_u64() {
            Some(n) if n > 0 && n <= u32::MAX as u64 => Ok(Some(n as u32)),
            _ => Err(ValidationError::invalid(
                "max_tokens",
                "must be a positive integer",
            )),
        },
        Some(_) => Err(ValidationError::invalid(
            "max_tokens",
            "must be a positive integer",
        )),
    }
}

fn parse_stop(value: Option<&Value>) -> Result<Option<Vec<String>>, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(stop)) => Ok(Some(vec![stop.clone()])),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ValidationError::invalid("stop", "must contain only strings"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(_) => Err(ValidationError::invalid(
            "stop",
            "must be a string or an array of strings",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn chat(body: Value) -> Result<CanonicalRequest, ValidationError> {
        parse_request(RequestKind::Chat, body.to_string().as_bytes())
    }

    #[test]
    fn test_valid_chat_request() {
        let request = chat(json!({
            "model": "gpt-4",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "hi "}, {"type": "text", "text": "there"}]}
            ],
            "temperature": 0.2,
            "max_tokens": 64,
            "stop": "\n",
            "stream": true,
            "user": "alice",
            "seed": 7
        }))
        .unwrap();

        assert_eq!(request.kind, RequestKind::Chat);
        assert_eq!(request.model, "gpt-4");
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "hi there");
        assert_eq!(request.params.temperature, Some(0.2));
        assert_eq!(request.params.max_tokens, Some(64));
        assert_eq!(request.params.stop, Some(vec!["\n".to_string()]));
        assert!(request.stream);
        assert_eq!(request.user.as_deref(), Some("alice"));
        assert_eq!(request.params.extra.get("seed"), Some(&json!(7)));
        assert!(!request.params.extra.contains_key("messages"));
    }

    #[test]
    fn test_malformed_json() {
        let err = parse_request(RequestKind::Chat, b"{not json").unwrap_err();
        assert_matches!(err, ValidationError::MalformedJson(_));

        let err = parse_request(RequestKind::Chat, b"[1, 2]").unwrap_err();
        assert_matches!(err, ValidationError::MalformedJson(_));
    }

    #[test]
    fn test_missing_fields() {
        assert_eq!(
            chat(json!({"messages": [{"role": "user", "content": "x"}]})).unwrap_err(),
            ValidationError::MissingField("model")
        );
        assert_eq!(
            chat(json!({"model": "gpt-4"})).unwrap_err(),
            ValidationError::MissingField("messages")
        );
        assert_eq!(
            parse_request(RequestKind::Text, br#"{"model": "gpt-4"}"#).unwrap_err(),
            ValidationError::MissingField("prompt")
        );
    }

    #[test]
    fn test_invalid_messages() {
        let err = chat(json!({"model": "gpt-4", "messages": []})).unwrap_err();
        assert_eq!(err.param(), Some("messages"));

        let err = chat(json!({"model": "gpt-4", "messages": [{"role": "wizard", "content": "x"}]}))
            .unwrap_err();
        assert!(err.to_string().contains("unknown role 'wizard'"));

        let err = chat(json!({"model": "gpt-4", "messages": [{"role": "user", "content": 42}]}))
            .unwrap_err();
        assert_eq!(err.param(), Some("messages"));

        let err = chat(json!({"model": "gpt-4", "messages": [{"role": "user", "content": [{"type": "image_url"}]}]}))
            .unwrap_err();
        assert!(err.to_string().contains("unsupported content parts"));
    }

    #[test]
    fn test_assistant_without_content_allowed() {
        let request = chat(json!({
            "model": "gpt-4",
            "messages": [
                {"role": "user", "content": "x"},
                {"role": "assistant", "content": null}
            ]
        }))
        .unwrap();
        assert_eq!(request.messages[1].content, "");
    }

    #[test]
    fn test_parameter_ranges() {
        let base = |key: &str, value: Value| {
            let mut body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "x"}]});
            body[key] = value;
            chat(body)
        };

        assert_eq!(base("temperature", json!(2.5)).unwrap_err().param(), Some("temperature"));
        assert_eq!(base("temperature", json!(-0.1)).unwrap_err().param(), Some("temperature"));
        assert!(base("temperature", json!(2)).is_ok());
        assert_eq!(base("top_p", json!(1.5)).unwrap_err().param(), Some("top_p"));
        assert_eq!(base("max_tokens", json!(0)).unwrap_err().param(), Some("max_tokens"));
        assert_eq!(base("max_tokens", json!(-5)).unwrap_err().param(), Some("max_tokens"));
        assert_eq!(base("max_tokens", json!(1.5)).unwrap_err().param(), Some("max_tokens"));
        assert_eq!(base("stream", json!("yes")).unwrap_err().param(), Some("stream"));
        assert_eq!(base("stop", json!([1])).unwrap_err().param(), Some("stop"));
        assert!(base("temperature", Value::Null).is_ok());
    }

    #[test]
    fn test_text_prompt() {
        let request =
            parse_request(RequestKind::Text, br#"{"model": "gpt-4", "prompt": ["once"]}"#).unwrap();
        assert_eq!(request.prompt.as_deref(), Some("once"));
        assert!(request.messages.is_empty());

        let err = parse_request(RequestKind::Text, br#"{"model": "gpt-4", "prompt": ""}"#)
            .unwrap_err();
        assert_eq!(err.param(), Some("prompt"));
    }

    #[test]
    fn test_unknown_alias_rejected_before_routing() {
        let config = AppConfig::from_yaml_str(
            r#"
model_list:
  - model_name: gpt-4
    deployments:
      - provider: openai
        api_base: http://a
        api_key: key-a
        model: m
"#,
        )
        .unwrap();
        let table = RoutingTable::from_config(&config);
        let body = json!({"model": "gpt-5", "messages": [{"role": "user", "content": "x"}]});

        let err =
            build_routed_request(&table, RequestKind::Chat, body.to_string().as_bytes(), "r1")
                .unwrap_err();
        assert_eq!(err, ValidationError::UnknownModel("gpt-5".to_string()));

        let body = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "x"}], "user": "bob"});
        let routed =
            build_routed_request(&table, RequestKind::Chat, body.to_string().as_bytes(), "r2")
                .unwrap();
        assert_eq!(routed.request_id, "r2");
        assert_eq!(routed.alias, "gpt-4");
        assert_eq!(routed.caller.as_deref(), Some("bob"));
    }
}
