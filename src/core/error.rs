//! Error types and handling for the routing proxy.
//!
//! [`AppError`] is the only error that reaches the HTTP layer. Upstream
//! failures never do directly: the fallback engine absorbs them and at most
//! surfaces a [`RoutingExhaustedError`] with a credential-free attempt summary.

use crate::core::error_types::{
    ExhaustionReason, ERROR_CODE_INVALID_API_KEY, ERROR_CODE_MODEL_NOT_FOUND,
    ERROR_CODE_ROUTING_EXHAUSTED, ERROR_TYPE_API, ERROR_TYPE_AUTHENTICATION,
    ERROR_TYPE_INVALID_REQUEST, ERROR_TYPE_SERVICE_UNAVAILABLE,
};
use crate::services::routed_request::AttemptRecord;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Malformed or unserviceable inbound request. Never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid JSON body: {0}")]
    MalformedJson(String),

    #[error("Missing required parameter: '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("The model '{0}' does not exist")]
    UnknownModel(String),
}

impl ValidationError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }

    /// Offending parameter, if any.
    pub fn param(&self) -> Option<&'static str> {
        match self {
            Self::MalformedJson(_) => None,
            Self::MissingField(field) => Some(*field),
            Self::InvalidField { field, .. } => Some(*field),
            Self::UnknownModel(_) => Some("model"),
        }
    }
}

/// Internal routing signal: nothing left to try for `alias`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No eligible deployment for model '{alias}'")]
pub struct NoEligibleDeploymentError {
    pub alias: String,
}

/// Terminal routing failure carrying the full attempt history.
#[derive(Error, Debug, Clone)]
#[error("All deployments for model '{alias}' failed ({reason}) after {} attempt(s)", .attempts.len())]
pub struct RoutingExhaustedError {
    pub alias: String,
    pub reason: ExhaustionReason,
    pub attempts: Vec<AttemptRecord>,
}

impl RoutingExhaustedError {
    /// Deployment ids and outcome classes only.
    pub fn attempt_summary(&self) -> Vec<Value> {
        self.attempts
            .iter()
            .map(|attempt| {
                json!({
                    "deployment": attempt.deployment_id,
                    "outcome": attempt.outcome.as_label(),
                    "latency_ms": attempt.latency_ms,
                })
            })
            .collect()
    }
}

/// Main error type for the HTTP surface.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    RoutingExhausted(#[from] RoutingExhaustedError),

    /// Missing or wrong admin key
    #[error("Unauthorized")]
    Unauthorized,

    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(ValidationError::UnknownModel(_)) => StatusCode::NOT_FOUND,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::RoutingExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// JSON error body in the OpenAI shape.
    pub fn to_body(&self) -> Value {
        let status = self.status_code();
        match self {
            AppError::Validation(err) => {
                let code = match err {
                    ValidationError::UnknownModel(_) => json!(ERROR_CODE_MODEL_NOT_FOUND),
                    _ => Value::Null,
                };
                json!({
                    "error": {
                        "message": err.to_string(),
                        "type": ERROR_TYPE_INVALID_REQUEST,
                        "param": err.param(),
                        "code": code,
                    }
                })
            }
            AppError::RoutingExhausted(err) => json!({
                "error": {
                    "message": err.to_string(),
                    "type": ERROR_TYPE_SERVICE_UNAVAILABLE,
                    "code": ERROR_CODE_ROUTING_EXHAUSTED,
                    "reason": err.reason.as_str(),
                    "attempts": err.attempt_summary(),
                }
            }),
            AppError::Unauthorized => json!({
                "error": {
                    "message": "Unauthorized",
                    "type": ERROR_TYPE_AUTHENTICATION,
                    "code": ERROR_CODE_INVALID_API_KEY,
                }
            }),
            other => json!({
                "error": {
                    "message": other.to_string(),
                    "type": ERROR_TYPE_API,
                    "code": status.as_u16(),
                }
            }),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "Request failed");
        }
        (status, Json(self.to_body())).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterErrorKind;
    use crate::services::health_tracker::Outcome;

    #[test]
    fn test_validation_display() {
        let err = ValidationError::MissingField("messages");
        assert_eq!(err.to_string(), "Missing required parameter: 'messages'");
        assert_eq!(err.param(), Some("messages"));

        let err = ValidationError::invalid("temperature", "must be between 0 and 2");
        assert_eq!(
            err.to_string(),
            "Invalid value for 'temperature': must be between 0 and 2"
        );
    }

    #[test]
    fn test_validation_status_codes() {
        let err = AppError::from(ValidationError::MissingField("model"));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_body()["error"]["type"], "invalid_request_error");

        let err = AppError::from(ValidationError::UnknownModel("gpt-9".to_string()));
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.to_body()["error"]["code"], "model_not_found");
    }

    #[test]
    fn test_exhausted_body_contains_summary_only() {
        let err = RoutingExhaustedError {
            alias: "gpt-4".to_string(),
            reason: ExhaustionReason::NoEligibleDeployment,
            attempts: vec![
                AttemptRecord {
                    deployment_id: "gpt-4/0".to_string(),
                    outcome: Outcome::Failure(AdapterErrorKind::Timeout),
                    latency_ms: 60_000,
                },
                AttemptRecord {
                    deployment_id: "gpt-4/1".to_string(),
                    outcome: Outcome::Failure(AdapterErrorKind::Auth),
                    latency_ms: 12,
                },
            ],
        };
        let app = AppError::from(err);
        assert_eq!(app.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let body = app.to_body();
        assert_eq!(body["error"]["type"], "service_unavailable");
        assert_eq!(body["error"]["reason"], "no_eligible_deployment");
        let attempts = body["error"]["attempts"].as_array().unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0]["deployment"], "gpt-4/0");
        assert_eq!(attempts[0]["outcome"], "TIMEOUT");
        assert_eq!(attempts[1]["latency_ms"], 12);
    }

    #[test]
    fn test_unauthorized_response() {
        let response = AppError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_internal_response() {
        let err = AppError::Internal("boom".to_string());
        assert_eq!(err.to_string(), "Internal server error: boom");
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
