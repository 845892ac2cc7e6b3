//! Router assembly: HTTP endpoints, WebSocket upgrade, static files, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSocket at `/ws`
/// - lesson session API under `/api/v1/...`
/// - Static SPA from `./static` with index fallback
/// - CORS (allow any origin/method/headers), adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    let static_service = ServeDir::new("./static")
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new("./static/index.html"));

    Router::new()
        .route("/ws", get(ws::ws_upgrade))
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/sessions", post(http::http_start_session))
        .route(
            "/api/v1/sessions/:id",
            get(http::http_get_session).delete(http::http_close_session),
        )
        .route("/api/v1/sessions/:id/answer", post(http::http_post_answer))
        .route("/api/v1/sessions/:id/audio", post(http::http_post_audio))
        .route("/api/v1/sessions/:id/advance", post(http::http_post_advance))
        .route("/api/v1/sessions/:id/retry", post(http::http_post_retry))
        .route("/api/v1/sessions/:id/force_advance", post(http::http_post_force_advance))
        .route("/api/v1/users/:id", get(http::http_get_user))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .fallback_service(static_service)
}
