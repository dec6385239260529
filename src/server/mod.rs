//! HTTP server for the RAG service

pub mod routes;
pub mod state;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use log::info;

use crate::error::{RagError, Result};
pub use state::AppState;

/// Room for multipart framing around the file itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build the `/api` router
pub fn router(state: AppState) -> Router {
    let max_upload = state.config().snapshot().upload.max_file_size as usize;

    let api = Router::new()
        .route("/health", get(routes::health))
        .route(
            "/upload",
            post(routes::upload)
                .layer(DefaultBodyLimit::max(max_upload.saturating_add(MULTIPART_OVERHEAD))),
        )
        .route("/query", post(routes::query))
        .route("/query/stream", post(routes::query_stream))
        .route("/config", get(routes::get_config).put(routes::update_config));

    Router::new().nest("/api", api).with_state(state)
}

/// Serve the API on `addr` until the process receives Ctrl-C
pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| RagError::Config(format!("failed to bind {}: {}", addr, e)))?;

    info!("Starting SenRAG server on http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutting down...");
    }
}
