//! HTTP middleware for request tracking and metrics.
//!
//! This module provides middleware for tracking request metrics including
//! duration, active requests, and status codes, and for tagging every
//! request with a request ID.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use prometheus::Gauge;
use std::time::Instant;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const ROUTED_DEPLOYMENT_HEADER: &str = "x-routed-deployment";

/// Longest inbound request id we are willing to echo back.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Extension type for storing the requested alias in the response
#[derive(Clone, Debug)]
pub struct ModelName(pub String);

/// Extension type for storing the deployment that served the response
#[derive(Clone, Debug)]
pub struct DeploymentName(pub String);

/// Paths that carry routed LLM traffic.
const LLM_ENDPOINTS: &[&str] = &[
    "/chat/completions",
    "/v1/chat/completions",
    "/completions",
    "/v1/completions",
];

/// Assign a request ID (reusing a sane inbound `x-request-id`), run the rest
/// of the stack inside a `REQUEST_ID` scope and echo the ID on the response.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    let mut response = REQUEST_ID.scope(request_id.clone(), next.run(request)).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Holds one unit of the `active_requests` gauge until dropped, so a request
/// whose future is dropped (client disconnect) still gives it back.
struct ActiveRequestGuard(Gauge);

impl ActiveRequestGuard {
    fn new(gauge: Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveRequestGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track metrics for incoming requests.
    ///
    /// This middleware:
    /// - Increments active request counter
    /// - Measures request duration
    /// - Records request count by status code
    /// - Logs request details
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let endpoint = request.uri().path().to_string();
        let method = request.method().to_string();

        // Skip metrics endpoint itself to avoid recursion
        if endpoint == "/metrics" {
            return next.run(request).await;
        }

        let metrics = get_metrics();
        let _active =
            ActiveRequestGuard::new(metrics.active_requests.with_label_values(&[&endpoint]));

        let start = Instant::now();
        let response = next.run(request).await;
        let duration = start.elapsed().as_secs_f64();
        let status_code = response.status().as_u16().to_string();

        let model = response
            .extensions()
            .get::<ModelName>()
            .map(|m| m.0.as_str())
            .unwrap_or("unknown");
        let deployment = response
            .extensions()
            .get::<DeploymentName>()
            .map(|d| d.0.as_str())
            .unwrap_or("-");

        let is_llm_endpoint = LLM_ENDPOINTS.contains(&endpoint.as_str());
        if is_llm_endpoint {
            metrics
                .request_count
                .with_label_values(&[&method, &endpoint, model, &status_code])
                .inc();
            metrics
                .request_duration
                .with_label_values(&[&method, &endpoint, model])
                .observe(duration);

            // For streaming responses this is time to first byte: next.run()
            // returns once headers are ready
            let is_streaming = response
                .headers()
                .get(axum::http::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|ct| ct.contains("text/event-stream"))
                .unwrap_or(false);

            tracing::info!(
                "{} {} - status={} model={} deployment={} {}={:.3}s",
                method,
                endpoint,
                status_code,
                model,
                deployment,
                if is_streaming { "ttfb" } else { "duration" },
                duration
            );
        } else {
            tracing::debug!(
                "{} {} - status={} duration={:.3}s",
                method,
                endpoint,
                status_code,
                duration
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logging::get_request_id;
    use crate::core::metrics::init_metrics;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::{get, post},
        Router,
    };
    use std::sync::Arc;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_middleware_tracks_request() {
        init_metrics();

        async fn handler() -> &'static str {
            "ok"
        }

        let app = Router::new()
            .route("/test", get(handler))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let request = Request::builder().uri("/test").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_increments_active_requests() {
        init_metrics();
        let metrics = get_metrics();

        let endpoint = "/test-active-requests";
        let initial = metrics.active_requests.with_label_values(&[endpoint]).get();

        let in_handler = Arc::new(tokio::sync::Mutex::new(false));
        let in_handler_clone = in_handler.clone();

        async fn slow_handler(flag: Arc<tokio::sync::Mutex<bool>>) -> &'static str {
            *flag.lock().await = true;
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
            "ok"
        }

        let app = Router::new()
            .route(endpoint, get(move || slow_handler(in_handler_clone)))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let request = Request::builder()
            .uri(endpoint)
            .body(Body::empty())
            .unwrap();

        let handle = tokio::spawn(async move { app.oneshot(request).await.unwrap() });

        while !*in_handler.lock().await {
            tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
        }

        let during = metrics.active_requests.with_label_values(&[endpoint]).get();
        assert!(during > initial);

        let _response = handle.await.unwrap();
        let final_count = metrics.active_requests.with_label_values(&[endpoint]).get();
        assert_eq!(final_count, initial);
    }

    #[tokio::test]
    async fn test_active_requests_released_when_request_dropped() {
        init_metrics();
        let metrics = get_metrics();

        let endpoint = "/test-active-dropped";
        let initial = metrics.active_requests.with_label_values(&[endpoint]).get();

        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
        let entered_tx = Arc::new(std::sync::Mutex::new(Some(entered_tx)));

        let app = Router::new()
            .route(
                endpoint,
                get(move || {
                    let entered_tx = entered_tx.clone();
                    async move {
                        if let Some(tx) = entered_tx.lock().unwrap().take() {
                            let _ = tx.send(());
                        }
                        futures::future::pending::<&'static str>().await
                    }
                }),
            )
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let request = Request::builder()
            .uri(endpoint)
            .body(Body::empty())
            .unwrap();
        let handle = tokio::spawn(async move { app.oneshot(request).await });

        entered_rx.await.unwrap();
        let during = metrics.active_requests.with_label_values(&[endpoint]).get();
        assert_eq!(during, initial + 1.0);

        // the client goes away: the request future is dropped mid-flight
        handle.abort();
        let _ = handle.await;

        let after = metrics.active_requests.with_label_values(&[endpoint]).get();
        assert_eq!(after, initial);
    }

    #[tokio::test]
    async fn test_middleware_records_llm_requests() {
        init_metrics();
        let metrics = get_metrics();

        async fn handler() -> Response {
            let mut response = Response::new(Body::from("ok"));
            response
                .extensions_mut()
                .insert(ModelName("mw-test-alias".to_string()));
            response
                .extensions_mut()
                .insert(DeploymentName("mw-test-alias/0".to_string()));
            response
        }

        let app = Router::new()
            .route("/v1/completions", post(handler))
            .layer(middleware::from_fn(MetricsMiddleware::track_metrics));

        let request = Request::builder()
            .method("POST")
            .uri("/v1/completions")
            .body(Body::empty())
            .unwrap();
        let _response = app.oneshot(request).await.unwrap();

        let histogram = metrics.request_duration.with_label_values(&[
            "POST",
            "/v1/completions",
            "mw-test-alias",
        ]);
        assert!(histogram.get_sample_count() > 0);
        let count = metrics.request_count.with_label_values(&[
            "POST",
            "/v1/completions",
            "mw-test-alias",
            "200",
        ]);
        assert!(count.get() > 0);
    }

    #[tokio::test]
    async fn test_request_id_generated_and_scoped() {
        async fn handler() -> String {
            get_request_id()
        }

        let app = Router::new()
            .route("/id", get(handler))
            .layer(middleware::from_fn(request_id_middleware));

        let response = app
            .oneshot(Request::builder().uri("/id").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let header = response
            .headers()
            .get("x-request-id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert_eq!(header.len(), 36);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(body, header.as_bytes());
    }

    #[tokio::test]
    async fn test_request_id_inbound_header_reused() {
        async fn handler() -> String {
            get_request_id()
        }

        let app = Router::new()
            .route("/id", get(handler))
            .layer(middleware::from_fn(request_id_middleware));

        let request = Request::builder()
            .uri("/id")
            .header("x-request-id", "client-supplied-1")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            "client-supplied-1"
        );

        let oversized = "x".repeat(500);
        let request = Request::builder()
            .uri("/id")
            .header("x-request-id", oversized.as_str())
            .body(Body::empty())
            .unwrap();
        let app = Router::new()
            .route("/id", get(handler))
            .layer(middleware::from_fn(request_id_middleware));
        let response = app.oneshot(request).await.unwrap();
        assert_ne!(response.headers().get("x-request-id").unwrap(), oversized.as_str());
    }
}
