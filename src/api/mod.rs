//! API layer for the routing proxy.
//!
//! This module contains all HTTP handlers, request/response models,
//! streaming support and the route table.

pub mod disconnect;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod streaming;

// Re-export commonly used types
pub use handlers::{
    chat_completions, completions, deployment_health, health, list_models, metrics_handler,
    model_info, reload_config, AppState,
};
pub use models::{ChatCompletionRequest, ChatCompletionResponse, HealthResponse, ModelList};
pub use routes::{build_router, ApiDoc};
pub use streaming::create_sse_response;
