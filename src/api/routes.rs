//! Route table, middleware stack and OpenAPI document.

use crate::api::handlers::{self, AppState};
use crate::api::models::*;
use crate::core::middleware::{request_id_middleware, MetricsMiddleware};
use crate::services::DeploymentHealth;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::chat_completions,
        handlers::completions,
        handlers::list_models,
        handlers::model_info,
        handlers::health,
        handlers::deployment_health,
        handlers::reload_config,
    ),
    components(
        schemas(
            ChatCompletionRequest,
            CompletionRequest,
            ChatCompletionResponse,
            TextCompletionResponse,
            Message,
            Choice,
            TextChoice,
            Usage,
            ModelList,
            ModelInfo,
            ModelInfoResponse,
            AliasInfo,
            DeploymentInfo,
            HealthResponse,
            DeploymentHealthResponse,
            DeploymentHealth,
            ReloadResponse,
            ApiErrorResponse,
            ApiErrorDetail,
        )
    ),
    tags(
        (name = "completions", description = "OpenAI-compatible completion endpoints"),
        (name = "models", description = "Model aliases and their deployments"),
        (name = "health", description = "Liveness and deployment health"),
        (name = "admin", description = "Configuration management")
    ),
    info(
        title = "LLM Router API",
        version = "1.0.0",
        description = "Routes OpenAI-style completion requests across weighted provider deployments with retries and fallback.",
        license(name = "MIT")
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            );
        }
    }
}

/// Build router with all endpoints
pub fn build_router(state: Arc<AppState>) -> Router {
    let swagger_ui = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi());

    // Routed traffic gets request metrics; operational endpoints do not
    let completion_routes = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/completions", post(handlers::completions))
        .layer(axum::middleware::from_fn(MetricsMiddleware::track_metrics));

    Router::new()
        .merge(completion_routes)
        .route("/v1/models", get(handlers::list_models))
        .route("/models", get(handlers::list_models))
        .route("/model/info", get(handlers::model_info))
        .route("/health", get(handlers::health))
        .route("/health/deployments", get(handlers::deployment_health))
        .route("/admin/reload", post(handlers::reload_config))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
        .merge(swagger_ui)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
