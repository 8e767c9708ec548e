//! Per-request routing state.

use crate::adapter::CanonicalRequest;
use crate::core::cancel::CancelHandle;
use crate::services::health_tracker::Outcome;
use serde::Serialize;

/// One upstream attempt in a request's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub deployment_id: String,
    #[serde(serialize_with = "serialize_outcome")]
    pub outcome: Outcome,
    pub latency_ms: u64,
}

impl AttemptRecord {
    pub fn new(deployment_id: impl Into<String>, outcome: Outcome, latency_ms: u64) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            outcome,
            latency_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

fn serialize_outcome<S: serde::Serializer>(outcome: &Outcome, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(outcome.as_label())
}

/// An inbound call on its way through the fallback engine.
///
/// Created by the gateway once validation passes and consumed by
/// [`FallbackEngine::execute`](crate::services::fallback::FallbackEngine::execute).
#[derive(Debug)]
pub struct RoutedRequest {
    pub request_id: String,
    pub alias: String,
    pub request: CanonicalRequest,
    /// End-user identifier forwarded to the quota signal
    pub caller: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub cancel: CancelHandle,
}

impl RoutedRequest {
    pub fn new(request_id: impl Into<String>, request: CanonicalRequest) -> Self {
        Self {
            request_id: request_id.into(),
            alias: request.model.clone(),
            caller: request.user.clone(),
            request,
            attempts: Vec::new(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterErrorKind, CanonicalMessage, Role};

    #[test]
    fn test_new_takes_alias_and_caller_from_request() {
        let mut request =
            CanonicalRequest::chat("gpt-4", vec![CanonicalMessage::new(Role::User, "hi")]);
        request.user = Some("alice".to_string());

        let routed = RoutedRequest::new("req-1", request);
        assert_eq!(routed.alias, "gpt-4");
        assert_eq!(routed.caller.as_deref(), Some("alice"));
        assert!(routed.attempts.is_empty());
        assert!(!routed.cancel.is_cancelled());
    }

    #[test]
    fn test_attempt_record_serializes_outcome_label() {
        let record = AttemptRecord::new("gpt-4/0", Outcome::Failure(AdapterErrorKind::RateLimit), 7);
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["outcome"], "RATE_LIMIT");
        assert_eq!(value["deployment_id"], "gpt-4/0");
        assert!(!record.is_success());
        assert!(AttemptRecord::new("gpt-4/1", Outcome::Success, 1).is_success());
    }
}
