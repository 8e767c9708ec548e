//! Core functionality for the routing proxy.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Metrics collection
//! - HTTP middleware

pub mod cancel;
pub mod config;
pub mod error;
pub mod error_types;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;

// Re-export commonly used types
pub use cancel::CancelHandle;
pub use config::{AppConfig, ServerConfig};
pub use error::{AppError, Result};
pub use logging::{get_deployment_context, get_request_id, DEPLOYMENT_CONTEXT, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::MetricsMiddleware;
