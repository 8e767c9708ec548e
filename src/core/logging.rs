//! Logging context for correlated request logs.
//!
//! Handlers run inside a `REQUEST_ID` scope, and each upstream attempt runs
//! inside a `DEPLOYMENT_CONTEXT` scope, so any log line emitted deep in the
//! adapter can be tied back to the inbound request and the deployment it hit.

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

tokio::task_local! {
    /// Task-local storage for the deployment the current attempt targets.
    pub static DEPLOYMENT_CONTEXT: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Get the current deployment id from context, if set.
pub fn get_deployment_context() -> String {
    DEPLOYMENT_CONTEXT
        .try_with(|ctx| ctx.clone())
        .unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Create a tracing span tagged with a deployment id.
#[macro_export]
macro_rules! deployment_span {
    ($name:expr, $deployment:expr) => {
        tracing::info_span!($name, deployment = %$deployment)
    };
}
