//! Health HTTP server for loopcast
//!
//! Exposes the supervisor's health snapshot for external polling.

use axum::{extract::State, routing::get, Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::watch;
use tracing::info;

use crate::health::HealthTracker;
use crate::metrics::{collect_system_metrics, HealthReport};

/// Errors that can occur when running the health server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Health server failed: {0}")]
    Serve(#[from] std::io::Error),
}

/// Handler for GET /health
/// Returns the current HealthReport as JSON
async fn get_health(State(health): State<watch::Receiver<HealthTracker>>) -> Json<HealthReport> {
    // take the snapshot before sampling the system so the borrow is short
    let status = health.borrow().snapshot();
    Json(HealthReport::new(status, collect_system_metrics()))
}

/// Creates the axum Router with the health endpoint
pub fn create_health_router(health: watch::Receiver<HealthTracker>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .with_state(health)
}

/// Runs the health HTTP server on `addr` until `shutdown` resolves
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if the address cannot be bound or serving fails
pub async fn run_health_server(
    health: watch::Receiver<HealthTracker>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let app = create_health_router(health);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(%addr, "health endpoint listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
