//! Axum HTTP server for the health endpoints

use std::future::Future;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::handlers::{self, ApiState};
use crate::{Error, Result};

pub fn router(state: ApiState) -> Router {
    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz));
    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(handlers::metrics));

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn run_server<F>(addr: SocketAddr, state: ApiState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("Failed to bind {}: {}", addr, e)))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::ConfigError(format!("HTTP server error: {}", e)))
}
