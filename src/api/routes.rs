//! API route definitions

use crate::auth::{self, ApiKeys};
use crate::gpu::GpuDetector;
use crate::models::ModelRegistry;
use crate::system::SystemSampler;
use crate::token_store::TokenStore;
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
    pub registry: Arc<ModelRegistry>,
    pub token_store: Arc<TokenStore>,
    pub gpu_detector: GpuDetector,
    pub system_sampler: SystemSampler,
    /// Keys guarding the OpenAI-compatible routes
    pub api_keys: Arc<ApiKeys>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let api_keys = state.api_keys.clone();
    let openai = Router::new()
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route_layer(middleware::from_fn(move |req, next| {
            let keys = api_keys.clone();
            auth::api_key_middleware(keys, req, next)
        }));

    Router::new()
        // Health and status
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        // Admin: dashboard and lifecycle
        .route("/api/admin/status", get(handlers::get_status))
        .route("/api/admin/models/{key}/load", post(handlers::load_model))
        .route(
            "/api/admin/models/{key}/download",
            post(handlers::download_model),
        )
        .route("/api/admin/models/{key}/unload", post(handlers::unload_model))
        .route(
            "/api/admin/huggingface/token",
            get(handlers::get_token).post(handlers::set_token),
        )
        // Inference
        .route("/api/models/{key}/infer", post(handlers::infer_model))
        .route("/api/audio/transcriptions", post(handlers::transcribe))
        .route("/api/diarization/process", post(handlers::diarize))
        // OpenAI-compatible, behind the API key check
        .merge(openai)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
