//! API route definitions

use crate::auth::auth_middleware;
use crate::registry::BotRegistry;
use crate::service::NluService;
use crate::state::StateManager;
use axum::{
    Router, middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<NluService>,
    pub registry: Arc<BotRegistry>,
    pub state_manager: Arc<StateManager>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
    /// Bearer token required outside the public routes
    pub auth_token: Option<Arc<str>>,
}

/// Model-level routes, served at the root and under `/v1`
fn model_routes() -> Router<AppState> {
    Router::new()
        .route("/info", get(handlers::info))
        .route("/train", post(handlers::start_training))
        .route("/train/{model_id}", get(handlers::training_status))
        .route("/train/{model_id}/cancel", post(handlers::cancel_training))
        .route("/predict/{model_id}", post(handlers::predict))
        .route("/detect-lang", post(handlers::detect_language))
        .route("/exists/{model_id}", get(handlers::model_exists))
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let auth_token = state.auth_token.clone();

    let router = Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Tenants
        .route("/bots", get(handlers::list_bots))
        .route(
            "/bots/{bot_id}",
            get(handlers::get_bot)
                .put(handlers::mount_bot)
                .delete(handlers::unmount_bot),
        )
        .route(
            "/bots/{bot_id}/train/{lang}",
            get(handlers::get_bot_training).post(handlers::queue_bot_training),
        )
        .route(
            "/bots/{bot_id}/train/{lang}/cancel",
            post(handlers::cancel_bot_training),
        )
        .route("/bots/{bot_id}/predict", post(handlers::bot_predict))
        .merge(model_routes())
        .nest("/v1", model_routes())
        .with_state(state);

    let router = match auth_token {
        Some(token) => router.layer(middleware::from_fn_with_state(token, auth_middleware)),
        None => router,
    };

    router.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}
