//! Prometheus metrics for monitoring the routing proxy.
//!
//! This module provides a centralized metrics registry tracking requests,
//! upstream attempts, fallbacks and per-deployment health.

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of requests by method, endpoint, model and status
    pub request_count: IntCounterVec,

    /// Request duration histogram in seconds
    pub request_duration: HistogramVec,

    /// Number of currently active requests by endpoint
    pub active_requests: GaugeVec,

    /// Upstream attempts by alias, deployment and outcome
    pub attempts: IntCounterVec,

    /// Times a request moved on to another deployment
    pub fallbacks: IntCounterVec,

    /// Requests that ran out of deployments, attempts or time
    pub exhaustions: IntCounterVec,

    /// Upstream latency per deployment in seconds
    pub deployment_latency: HistogramVec,

    /// Deployment health (1=eligible, 0=circuit open)
    pub deployment_health: GaugeVec,

    /// Circuit state (0=closed, 1=half_open, 2=open)
    pub circuit_state: GaugeVec,

    /// Effective selection weight (weight × recent success rate)
    pub effective_weight: GaugeVec,

    /// Total token usage by alias, deployment and token type
    pub token_usage: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// Subsequent calls return the same instance.
///
/// # Examples
///
/// ```no_run
/// use llm_router::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.request_count.with_label_values(&["GET", "/health", "unknown", "200"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "llm_router_requests_total",
            "Total number of requests",
            &["method", "endpoint", "model", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "llm_router_request_duration_seconds",
            "Request duration in seconds",
            &["method", "endpoint", "model"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge_vec!(
            "llm_router_active_requests",
            "Number of active requests",
            &["endpoint"]
        )
        .expect("Failed to register active_requests metric");

        let attempts = register_int_counter_vec!(
            "llm_router_attempts_total",
            "Upstream attempts by outcome",
            &["alias", "deployment", "outcome"]
        )
        .expect("Failed to register attempts metric");

        let fallbacks = register_int_counter_vec!(
            "llm_router_fallbacks_total",
            "Requests moved to another deployment",
            &["alias", "from_deployment"]
        )
        .expect("Failed to register fallbacks metric");

        let exhaustions = register_int_counter_vec!(
            "llm_router_exhaustions_total",
            "Requests that exhausted routing",
            &["alias", "reason"]
        )
        .expect("Failed to register exhaustions metric");

        let deployment_latency = register_histogram_vec!(
            "llm_router_deployment_latency_seconds",
            "Upstream response latency in seconds",
            &["deployment"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
        )
        .expect("Failed to register deployment_latency metric");

        let deployment_health = register_gauge_vec!(
            "llm_router_deployment_health",
            "Deployment health status (1=healthy, 0=circuit open)",
            &["deployment"]
        )
        .expect("Failed to register deployment_health metric");

        let circuit_state = register_gauge_vec!(
            "llm_router_circuit_state",
            "Circuit breaker state (0=closed, 1=half_open, 2=open)",
            &["deployment"]
        )
        .expect("Failed to register circuit_state metric");

        let effective_weight = register_gauge_vec!(
            "llm_router_effective_weight",
            "Configured weight multiplied by recent success rate",
            &["deployment"]
        )
        .expect("Failed to register effective_weight metric");

        let token_usage = register_int_counter_vec!(
            "llm_router_tokens_total",
            "Total number of tokens used",
            &["alias", "deployment", "token_type"]
        )
        .expect("Failed to register token_usage metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            attempts,
            fallbacks,
            exhaustions,
            deployment_latency,
            deployment_health,
            circuit_state,
            effective_weight,
            token_usage,
        }
    })
}

/// Get the global metrics instance, initializing it on first use.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}
