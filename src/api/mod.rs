//! HTTP/WebSocket surface: a thin axum layer over the router.
//!
//! Handlers parse and validate, dispatch to the router/registry, and
//! shape errors into the structured JSON envelope. The same API router is
//! nested under `/api/v0` and `/api/v1`; Ollama-compatible routes live at
//! `/api/*`, and the realtime WebSocket at `/v1/realtime`.

pub mod audio;
pub mod handlers;
pub mod ollama;
pub mod realtime_ws;

use crate::error::GatewayError;
use crate::realtime::RealtimeSessionManager;
use crate::router::Router as ModelRouter;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ModelRouter>,
    pub sessions: Arc<RealtimeSessionManager>,
    pub shutdown: Arc<tokio::sync::Notify>,
}

/// Error wrapper carrying the JSON envelope and HTTP status.
pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.0.to_envelope())).into_response()
    }
}

/// Handler result type.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the complete application router.
pub fn build_app(state: AppState) -> Router {
    let api = api_routes();

    Router::new()
        .nest("/api/v0", api.clone())
        .nest("/api/v1", api)
        .merge(ollama::routes())
        .route("/v1/realtime", get(realtime_ws::realtime_upgrade))
        .route("/internal/shutdown", post(handlers::internal_shutdown))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/models", get(handlers::list_models))
        .route("/models/{id}", get(handlers::model_by_id))
        .route("/chat/completions", post(handlers::chat_completions))
        .route("/completions", post(handlers::completions))
        .route("/responses", post(handlers::responses))
        .route("/embeddings", post(handlers::embeddings))
        .route("/reranking", post(handlers::reranking))
        .route("/audio/transcriptions", post(handlers::audio_transcriptions))
        .route("/audio/speech", post(handlers::audio_speech))
        .route("/images/generations", post(handlers::image_generations))
        .route("/pull", post(handlers::pull))
        .route("/load", post(handlers::load))
        .route("/unload", post(handlers::unload))
        .route("/delete", post(handlers::delete))
        .route("/params", post(handlers::params))
        .route("/add-local-model", post(handlers::add_local_model))
        .route("/system-info", get(handlers::system_info))
        .route("/stats", get(handlers::stats))
        .route("/logs/stream", get(handlers::logs_stream))
}

/// Serve the application until shutdown is requested, then unload every
/// model and drain realtime sessions.
///
/// # Errors
///
/// Returns [`GatewayError::File`] when the listen address cannot be
/// bound; fatal at startup.
pub async fn serve(state: AppState, host: &str, port: u16) -> crate::error::Result<()> {
    let app = build_app(state.clone());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| GatewayError::File(format!("could not bind {addr}: {e}")))?;

    let display_host = if host == "0.0.0.0" { "localhost" } else { host };
    info!("server listening on http://{display_host}:{port}");

    let shutdown = Arc::clone(&state.shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::select! {
                _ = shutdown.notified() => {},
                _ = ctrl_c => {},
            }
            info!("shutdown requested");
        })
        .await
        .map_err(|e| GatewayError::Internal(format!("server error: {e}")))?;

    info!("draining realtime sessions");
    state.sessions.shutdown().await;
    info!("unloading models");
    state.router.unload_all().await;
    Ok(())
}
