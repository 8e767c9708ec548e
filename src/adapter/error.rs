//! Typed upstream failures and their classification.

use crate::core::config::Credential;
use crate::core::error_types::{
    ERROR_CATEGORY_AUTH, ERROR_CATEGORY_INVALID_REQUEST, ERROR_CATEGORY_RATE_LIMIT,
    ERROR_CATEGORY_SERVER_ERROR, ERROR_CATEGORY_TIMEOUT, ERROR_CATEGORY_UNKNOWN,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Failure classes the fallback engine makes decisions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterErrorKind {
    Auth,
    RateLimit,
    Timeout,
    ServerError,
    InvalidRequest,
    Unknown,
}

impl AdapterErrorKind {
    /// Whether the same deployment may be tried again.
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Timeout | Self::ServerError | Self::Unknown
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => ERROR_CATEGORY_AUTH,
            Self::RateLimit => ERROR_CATEGORY_RATE_LIMIT,
            Self::Timeout => ERROR_CATEGORY_TIMEOUT,
            Self::ServerError => ERROR_CATEGORY_SERVER_ERROR,
            Self::InvalidRequest => ERROR_CATEGORY_INVALID_REQUEST,
            Self::Unknown => ERROR_CATEGORY_UNKNOWN,
        }
    }

    /// Map an upstream HTTP status to a failure class.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            429 => Self::RateLimit,
            408 => Self::Timeout,
            400 | 404 | 409 | 413 | 415 | 422 => Self::InvalidRequest,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single failed upstream call.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    /// Upstream HTTP status, when one was received
    pub status: Option<u16>,
    /// Truncated, credential-free description
    pub message: String,
    /// Server-provided `Retry-After`, for rate limits
    pub retry_after: Option<Duration>,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: truncate_message(&message.into()),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    /// Build from a non-success HTTP response.
    pub fn from_status(
        status: u16,
        retry_after: Option<&str>,
        body: &str,
        credential: &Credential,
    ) -> Self {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|json| extract_error_message(&json))
            .unwrap_or_else(|| {
                if body.trim().is_empty() {
                    format!("upstream returned HTTP {}", status)
                } else {
                    body.to_string()
                }
            });

        let kind = AdapterErrorKind::from_status(status);
        let retry_after = if kind == AdapterErrorKind::RateLimit {
            parse_retry_after_seconds(retry_after).map(Duration::from_secs)
        } else {
            None
        };

        Self {
            kind,
            status: Some(status),
            message: truncate_message(&credential.redact(&message)),
            retry_after,
        }
    }

    /// Build from a transport-level failure (no usable HTTP status).
    pub fn from_transport(error: &reqwest::Error, credential: &Credential) -> Self {
        let kind = if error.is_timeout() {
            AdapterErrorKind::Timeout
        } else if error.is_connect() || error.is_request() {
            AdapterErrorKind::ServerError
        } else if let Some(status) = error.status() {
            AdapterErrorKind::from_status(status.as_u16())
        } else {
            AdapterErrorKind::Unknown
        };

        Self {
            kind,
            status: error.status().map(|s| s.as_u16()),
            message: truncate_message(&credential.redact(&error.to_string())),
            retry_after: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            AdapterErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }
}

/// Extract canonical error message from provider error payload.
pub fn extract_error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
        .or_else(|| {
            body.get("error")
                .and_then(|e| e.as_str())
                .map(|s| s.to_string())
        })
        .or_else(|| {
            body.get("message")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
}

fn truncate_message(message: &str) -> String {
    let mut chars = message.chars();
    let truncated: String = chars.by_ref().take(MAX_ERROR_MESSAGE_LEN).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

/// Parse a `Retry-After` header given either as seconds or as an HTTP date.
pub fn parse_retry_after_seconds(value: Option<&str>) -> Option<u64> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }

    let parsed = DateTime::parse_from_rfc2822(raw).ok()?;
    let now = Utc::now();
    if parsed.with_timezone(&Utc) <= now {
        return Some(0);
    }

    let delta = parsed.with_timezone(&Utc) - now;
    delta.num_seconds().try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(AdapterErrorKind::from_status(401), AdapterErrorKind::Auth);
        assert_eq!(AdapterErrorKind::from_status(403), AdapterErrorKind::Auth);
        assert_eq!(AdapterErrorKind::from_status(429), AdapterErrorKind::RateLimit);
        assert_eq!(AdapterErrorKind::from_status(408), AdapterErrorKind::Timeout);
        assert_eq!(
            AdapterErrorKind::from_status(400),
            AdapterErrorKind::InvalidRequest
        );
        assert_eq!(
            AdapterErrorKind::from_status(422),
            AdapterErrorKind::InvalidRequest
        );
        assert_eq!(AdapterErrorKind::from_status(500), AdapterErrorKind::ServerError);
        assert_eq!(AdapterErrorKind::from_status(503), AdapterErrorKind::ServerError);
        assert_eq!(AdapterErrorKind::from_status(418), AdapterErrorKind::Unknown);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(!AdapterErrorKind::Auth.is_retryable());
        assert!(!AdapterErrorKind::InvalidRequest.is_retryable());
        assert!(AdapterErrorKind::RateLimit.is_retryable());
        assert!(AdapterErrorKind::Timeout.is_retryable());
        assert!(AdapterErrorKind::ServerError.is_retryable());
        assert!(AdapterErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_from_status_extracts_message_and_redacts() {
        let credential = Credential::new("sk-live-abcdef");
        let body = r#"{"error":{"message":"Incorrect API key provided: sk-live-abcdef","type":"invalid_request_error"}}"#;
        let err = AdapterError::from_status(401, None, body, &credential);
        assert_eq!(err.kind, AdapterErrorKind::Auth);
        assert_eq!(err.status, Some(401));
        assert!(!err.message.contains("sk-live-abcdef"));
        assert!(err.message.contains("Incorrect API key provided"));
    }

    #[test]
    fn test_from_status_rate_limit_retry_after() {
        let credential = Credential::new("key");
        let err = AdapterError::from_status(429, Some("7"), "slow down", &credential);
        assert_eq!(err.kind, AdapterErrorKind::RateLimit);
        assert_eq!(err.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(err.message, "slow down");
    }

    #[test]
    fn test_from_status_empty_body() {
        let credential = Credential::new("key");
        let err = AdapterError::from_status(502, None, "", &credential);
        assert_eq!(err.kind, AdapterErrorKind::ServerError);
        assert_eq!(err.message, "upstream returned HTTP 502");
        assert!(err.retry_after.is_none());
    }

    #[test]
    fn test_truncate_message() {
        let long = "x".repeat(MAX_ERROR_MESSAGE_LEN + 10);
        let truncated = truncate_message(&long);
        assert!(truncated.ends_with("..."));
        assert_eq!(truncated.len(), MAX_ERROR_MESSAGE_LEN + 3);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after_seconds(Some("30")), Some(30));
        assert_eq!(parse_retry_after_seconds(Some("  ")), None);
        assert_eq!(parse_retry_after_seconds(None), None);
        assert_eq!(
            parse_retry_after_seconds(Some("Wed, 21 Oct 2015 07:28:00 GMT")),
            Some(0)
        );
        assert_eq!(parse_retry_after_seconds(Some("soon")), None);
    }

    #[test]
    fn test_extract_error_message_variants() {
        let nested = serde_json::json!({"error": {"message": "bad"}});
        let flat = serde_json::json!({"error": "worse"});
        let top = serde_json::json!({"message": "worst"});
        assert_eq!(extract_error_message(&nested).as_deref(), Some("bad"));
        assert_eq!(extract_error_message(&flat).as_deref(), Some("worse"));
        assert_eq!(extract_error_message(&top).as_deref(), Some("worst"));
        assert_eq!(extract_error_message(&serde_json::json!({})), None);
    }
}
