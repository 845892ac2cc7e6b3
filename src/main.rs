//! Lingualeap · Lesson Session Backend
//!
//! - Axum HTTP + WebSocket API around the lesson session engine
//! - Optional OpenAI scoring (via environment variables), offline grader otherwise
//! - Static SPA fallback (./static/index.html)
//!
//! Important env variables:
//!   PORT                 : u16 (default 3000)
//!   OPENAI_API_KEY       : enables OpenAI scoring if present
//!   OPENAI_BASE_URL      : default "https://api.openai.com/v1"
//!   OPENAI_SCORING_MODEL : default "gpt-4o-mini"
//!   OPENAI_AUDIO_MODEL   : default "gpt-4o-audio-preview"
//!   LESSON_CONFIG_PATH   : path to TOML config (prompts, engine/capture tuning, extra lessons)
//!   PROGRESS_PATH        : JSON file for lesson checkpoints (in-memory when unset)
//!   LOG_LEVEL            : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT           : "pretty" (default) or "json"

mod telemetry;
mod util;
mod error;
mod domain;
mod config;
mod seeds;
mod lessons;
mod audio;
mod scoring;
mod openai;
mod progress;
mod users;
mod skills;
mod session;
mod state;
mod protocol;
mod routes;
#[cfg(test)]
mod testing;

use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tracing::{info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared application state (lesson catalogue, scoring gateway, stores, sessions).
  let state = Arc::new(AppState::from_env().await);

  // HTTP router with routes, CORS and tracing layers.
  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "lingualeap_backend", %addr, "HTTP server listening");
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;
  info!(target: "lingualeap_backend", "Server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "lingualeap_backend", error = %e, "Failed to listen for shutdown signal");
    std::future::pending::<()>().await;
  }
  info!(target: "lingualeap_backend", "Shutdown signal received");
}
