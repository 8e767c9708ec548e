//! Shared constants for structured API errors and routing error semantics.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_SERVICE_UNAVAILABLE: &str = "service_unavailable";
pub const ERROR_TYPE_STREAM: &str = "stream_error";

pub const ERROR_CODE_MODEL_NOT_FOUND: &str = "model_not_found";
pub const ERROR_CODE_ROUTING_EXHAUSTED: &str = "routing_exhausted";
pub const ERROR_CODE_INVALID_API_KEY: &str = "invalid_api_key";

pub const ERROR_CATEGORY_AUTH: &str = "AUTH";
pub const ERROR_CATEGORY_RATE_LIMIT: &str = "RATE_LIMIT";
pub const ERROR_CATEGORY_TIMEOUT: &str = "TIMEOUT";
pub const ERROR_CATEGORY_SERVER_ERROR: &str = "SERVER_ERROR";
pub const ERROR_CATEGORY_INVALID_REQUEST: &str = "INVALID_REQUEST";
pub const ERROR_CATEGORY_UNKNOWN: &str = "UNKNOWN";

pub const EXHAUSTION_REASON_NO_ELIGIBLE: &str = "no_eligible_deployment";
pub const EXHAUSTION_REASON_ATTEMPT_BUDGET: &str = "attempt_budget_exhausted";
pub const EXHAUSTION_REASON_DEADLINE: &str = "deadline_exceeded";
pub const EXHAUSTION_REASON_CANCELLED: &str = "cancelled";

/// Why the fallback engine gave up on a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExhaustionReason {
    NoEligibleDeployment,
    AttemptBudget,
    DeadlineExceeded,
    Cancelled,
}

impl ExhaustionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoEligibleDeployment => EXHAUSTION_REASON_NO_ELIGIBLE,
            Self::AttemptBudget => EXHAUSTION_REASON_ATTEMPT_BUDGET,
            Self::DeadlineExceeded => EXHAUSTION_REASON_DEADLINE,
            Self::Cancelled => EXHAUSTION_REASON_CANCELLED,
        }
    }
}

impl fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_reason_labels() {
        assert_eq!(
            ExhaustionReason::NoEligibleDeployment.to_string(),
            "no_eligible_deployment"
        );
        assert_eq!(ExhaustionReason::DeadlineExceeded.as_str(), "deadline_exceeded");
        assert_eq!(ExhaustionReason::Cancelled.as_str(), "cancelled");
    }
}
