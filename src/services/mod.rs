//! Routing core: health tracking, deployment selection, the retry and
//! fallback engine, and inbound request validation.

pub mod fallback;
pub mod gateway;
pub mod health_tracker;
pub mod routed_request;
pub mod router;
pub mod routing_table;

// Re-export commonly used types
pub use fallback::{FallbackEngine, Payload, RetryPolicy, RoutedResponse};
pub use health_tracker::{Admission, CircuitState, DeploymentHealth, HealthTracker, Outcome};
pub use routed_request::{AttemptRecord, RoutedRequest};
pub use router::{DeploymentRouter, QuotaSignal, Selection, Unlimited};
pub use routing_table::{Deployment, ModelAlias, RoutingTable};
