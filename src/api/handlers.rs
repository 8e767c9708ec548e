//! HTTP request handlers for the routing proxy.
//!
//! This module contains the completion endpoints, model listings, health
//! views, metrics, and the admin reload endpoint.

use crate::adapter::{create_http_client, HttpAdapter, ProviderAdapter, RequestKind};
use crate::api::disconnect::DisconnectGuard;
use crate::api::models::*;
use crate::api::streaming::create_sse_response;
use crate::core::config::AppConfig;
use crate::core::logging::{generate_request_id, get_request_id, REQUEST_ID};
use crate::core::middleware::{DeploymentName, ModelName, ROUTED_DEPLOYMENT_HEADER};
use crate::core::{AppError, Result};
use crate::services::gateway::build_routed_request;
use crate::services::{
    DeploymentRouter, FallbackEngine, HealthTracker, Payload, RetryPolicy, RoutingTable,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;

/// Shared application state.
pub struct AppState {
    pub engine: Arc<FallbackEngine>,
    /// File re-read by `/admin/reload`
    pub config_path: Option<String>,
    pub admin_key: Option<String>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    /// Build the full routing stack over a pooled HTTP client.
    pub fn from_config(
        config: &AppConfig,
        config_path: Option<String>,
        admin_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = create_http_client(config.verify_ssl)?;
        Ok(Self::with_adapter(
            config,
            Arc::new(HttpAdapter::new(client)),
            config_path,
            admin_key,
        ))
    }

    pub fn with_adapter(
        config: &AppConfig,
        adapter: Arc<dyn ProviderAdapter>,
        config_path: Option<String>,
        admin_key: Option<String>,
    ) -> Self {
        let table = RoutingTable::from_config(config);
        let tracker = HealthTracker::new(config.circuit_breaker.clone());
        let router = Arc::new(DeploymentRouter::new(table, tracker, config.routing.seed));
        let engine = Arc::new(FallbackEngine::new(
            router,
            adapter,
            RetryPolicy::from(&config.routing),
        ));

        Self {
            engine,
            config_path,
            admin_key,
            reload_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn router(&self) -> &DeploymentRouter {
        self.engine.router()
    }

    /// Swap in a new configuration. Health of surviving deployments is kept.
    pub fn apply_config(&self, config: &AppConfig) {
        let router = self.router();
        router
            .tracker()
            .set_config(config.circuit_breaker.clone());
        self.engine.set_policy(RetryPolicy::from(&config.routing));
        if let Some(seed) = config.routing.seed {
            router.reseed(seed);
        }
        router.reload(RoutingTable::from_config(config));
    }
}

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses.
#[utoipa::path(
    post,
    path = "/v1/chat/completions",
    tag = "completions",
    request_body = ChatCompletionRequest,
    responses(
        (status = 200, description = "Completion (JSON, or SSE when stream=true)", body = ChatCompletionResponse),
        (status = 400, description = "Invalid request", body = ApiErrorResponse),
        (status = 404, description = "Unknown model alias", body = ApiErrorResponse),
        (status = 503, description = "All deployments failed", body = ApiErrorResponse)
    )
)]
pub async fn chat_completions(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    route_request(state, RequestKind::Chat, body).await
}

/// Handle legacy text completion requests.
#[utoipa::path(
    post,
    path = "/v1/completions",
    tag = "completions",
    request_body = CompletionRequest,
    responses(
        (status = 200, description = "Completion (JSON, or SSE when stream=true)", body = TextCompletionResponse),
        (status = 400, description = "Invalid request", body = ApiErrorResponse),
        (status = 404, description = "Unknown model alias", body = ApiErrorResponse),
        (status = 503, description = "All deployments failed", body = ApiErrorResponse)
    )
)]
pub async fn completions(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Response> {
    route_request(state, RequestKind::Text, body).await
}

async fn route_request(state: Arc<AppState>, kind: RequestKind, body: Bytes) -> Result<Response> {
    let request_id = match get_request_id() {
        id if id.is_empty() => generate_request_id(),
        id => id,
    };

    let table = state.router().table();
    let routed = build_routed_request(&table, kind, &body, &request_id)?;
    drop(table);

    let alias = routed.alias.clone();
    let stream = routed.request.stream;
    tracing::debug!(
        request_id = %request_id,
        alias = %alias,
        stream = stream,
        messages = routed.request.messages.len(),
        "Routing request"
    );

    // The engine runs on its own task so a client disconnect (which drops
    // this future) reaches it through the cancel handle.
    let guard = DisconnectGuard::new(routed.cancel.clone());
    let engine = state.engine.clone();
    let task = tokio::spawn(REQUEST_ID.scope(request_id.clone(), async move {
        engine.execute(routed).await
    }));
    let outcome = task
        .await
        .map_err(|e| AppError::Internal(format!("routing task failed: {}", e)))?;
    guard.disarm();
    let routed = outcome?;

    let deployment_id = routed.deployment.id.clone();
    let mut response = match routed.payload {
        Payload::Complete(canonical) => Json(render_response(kind, &alias, canonical)).into_response(),
        Payload::Stream(chunks) => create_sse_response(kind, alias.clone(), chunks),
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&deployment_id) {
        headers.insert(HeaderName::from_static(ROUTED_DEPLOYMENT_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    response.extensions_mut().insert(ModelName(alias));
    response.extensions_mut().insert(DeploymentName(deployment_id));

    Ok(response)
}

/// List model aliases.
#[utoipa::path(
    get,
    path = "/v1/models",
    tag = "models",
    responses(
        (status = 200, description = "Configured aliases", body = ModelList)
    )
)]
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    let table = state.router().table();
    let created = chrono::Utc::now().timestamp();

    Json(ModelList {
        object: "list".to_string(),
        data: table
            .aliases()
            .iter()
            .map(|alias| ModelInfo {
                id: alias.name.clone(),
                object: "model".to_string(),
                created,
                owned_by: "llm-router".to_string(),
            })
            .collect(),
    })
}

/// Aliases with their deployments. Credentials are never included.
#[utoipa::path(
    get,
    path = "/model/info",
    tag = "models",
    responses(
        (status = 200, description = "Aliases and deployments", body = ModelInfoResponse)
    )
)]
pub async fn model_info(State(state): State<Arc<AppState>>) -> Json<ModelInfoResponse> {
    let table = state.router().table();
    let tracker = state.router().tracker();

    let data = table
        .aliases()
        .iter()
        .map(|alias| AliasInfo {
            model_name: alias.name.clone(),
            deployments: alias
                .deployments
                .iter()
                .map(|d| DeploymentInfo {
                    id: d.id.clone(),
                    provider: d.provider.to_string(),
                    api_base: d.api_base.clone(),
                    model: d.model.clone(),
                    weight: d.weight,
                    max_concurrent_requests: d.max_concurrent_requests,
                    requests_per_second: d.rate_limit.as_ref().map(|r| r.requests_per_second),
                    circuit_state: tracker
                        .circuit_state(&d.id)
                        .map(|s| s.as_label().to_string())
                        .unwrap_or_else(|| "unknown".to_string()),
                })
                .collect(),
        })
        .collect();

    Json(ModelInfoResponse { data })
}

/// Liveness check.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let table = state.router().table();
    Json(HealthResponse {
        status: "ok".to_string(),
        aliases: table.aliases().len(),
        deployments: table.deployments().count(),
    })
}

/// Circuit state, success rate and load of every deployment.
#[utoipa::path(
    get,
    path = "/health/deployments",
    tag = "health",
    responses(
        (status = 200, description = "Health tracker snapshot", body = DeploymentHealthResponse)
    )
)]
pub async fn deployment_health(State(state): State<Arc<AppState>>) -> Json<DeploymentHealthResponse> {
    Json(DeploymentHealthResponse {
        deployments: state.router().tracker().snapshot(),
    })
}

/// Re-read the configuration file and swap the routing table.
#[utoipa::path(
    post,
    path = "/admin/reload",
    tag = "admin",
    responses(
        (status = 200, description = "Configuration reloaded", body = ReloadResponse),
        (status = 401, description = "Unauthorized", body = ApiErrorResponse),
        (status = 500, description = "Configuration invalid; previous table kept", body = ApiErrorResponse)
    ),
    security(("bearer_auth" = []))
)]
pub async fn reload_config(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ReloadResponse>> {
    verify_admin_auth(&headers, state.admin_key.as_deref())?;

    let path = state
        .config_path
        .clone()
        .ok_or_else(|| AppError::Internal("no configuration file to reload".to_string()))?;

    let _guard = state.reload_lock.lock().await;
    let config = AppConfig::load(&path)?;
    state.apply_config(&config);

    let table = state.router().table();
    tracing::info!(path = %path, "Configuration reloaded");
    Ok(Json(ReloadResponse {
        status: "ok".to_string(),
        aliases: table.aliases().len(),
        deployments: table.deployments().count(),
    }))
}

/// Verify the admin bearer key. Without a configured key the endpoint is open.
fn verify_admin_auth(headers: &HeaderMap, admin_key: Option<&str>) -> Result<()> {
    let Some(admin_key) = admin_key else {
        return Ok(());
    };

    let provided = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)?;

    if provided != admin_key {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

/// Prometheus metrics endpoint.
#[tracing::instrument]
pub async fn metrics_handler() -> Result<Response> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_admin_auth() {
        let mut headers = HeaderMap::new();
        assert!(verify_admin_auth(&headers, None).is_ok());
        assert!(matches!(
            verify_admin_auth(&headers, Some("secret")),
            Err(AppError::Unauthorized)
        ));

        headers.insert("authorization", HeaderValue::from_static("Bearer wrong"));
        assert!(verify_admin_auth(&headers, Some("secret")).is_err());

        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        assert!(verify_admin_auth(&headers, Some("secret")).is_ok());
    }
}
