//! HTTP server wiring

use std::net::SocketAddr;

use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use undertow_core::StreamingService;

use crate::handlers::{cache_stats, stream};

/// Shared state handed to every handler
#[derive(Clone, Debug)]
pub struct AppState {
    pub streaming: StreamingService,
}

impl AppState {
    pub fn new(streaming: StreamingService) -> Self {
        Self { streaming }
    }
}

/// Builds the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Subsonic clients call both spellings
        .route("/rest/stream", get(stream))
        .route("/rest/stream.view", get(stream))
        .route("/api/cache", get(cache_stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves `state` on `bind_address` until Ctrl-C.
///
/// # Errors
/// - `std::io::Error` - Address could not be bound or the server failed
pub async fn run_server(bind_address: SocketAddr, state: AppState) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    tracing::info!("Undertow streaming server running on http://{}", bind_address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
