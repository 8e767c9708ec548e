//! LLM Router - a routing proxy for LLM completion APIs
//!
//! Clients send OpenAI-style requests naming a model alias. Each alias maps
//! to a weighted list of provider deployments, and the router picks one
//! per attempt:
//!
//! - **Weighted selection**: deployments are drawn by weight among the healthy ones
//! - **Circuit breaking**: failing deployments are cooled down and re-probed
//! - **Retry and fallback**: transient errors are retried with backoff, then
//!   the request falls back to another deployment of the same alias
//! - **Streaming**: upstream SSE is re-emitted in the OpenAI chunk format
//! - **Metrics**: Prometheus counters and histograms per alias and deployment
//!
//! # Architecture
//!
//! - [`adapter`]: Provider wire formats and the HTTP adapter
//! - [`core`]: Config, errors, logging context, metrics, middleware
//! - [`services`]: Routing table, health tracker, router, fallback engine
//! - [`api`]: HTTP handlers, response models and the route table
//!
//! # Configuration
//!
//! Configuration is read from a YAML file (`--config` or `CONFIG_PATH`,
//! default `config.yaml`). Environment variables:
//! - `HOST`, `PORT`: override the bind address
//! - `VERIFY_SSL`: verify upstream TLS certificates (default: true)
//! - `ADMIN_KEY`: bearer key for `/admin/reload` (open when unset)
//! - `RUST_LOG`, `LOG_FORMAT=json`, `NO_COLOR`: logging

pub mod adapter;
pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, ApiDoc, AppState};
pub use core::{AppConfig, AppError, Result};
pub use services::{DeploymentRouter, FallbackEngine, HealthTracker, RoutingTable};
