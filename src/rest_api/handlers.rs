//! HTTP handlers for the health endpoints

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::instrument;

use crate::cluster::ClusterState;
use crate::controller::{ServiceKey, WorkQueue};

/// Shared state for the handlers
#[derive(Clone)]
pub struct ApiState {
    pub cluster: Arc<dyn ClusterState>,
    pub queue: WorkQueue<ServiceKey>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub synced: bool,
    pub queue_depth: usize,
    pub shutting_down: bool,
}

/// Liveness
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Ready once the informer caches synced, until shutdown begins
#[instrument(skip(state))]
pub async fn readyz(State(state): State<ApiState>) -> (StatusCode, Json<ReadyResponse>) {
    let body = ReadyResponse {
        synced: state.cluster.is_synced(),
        queue_depth: state.queue.len(),
        shutting_down: state.queue.is_shutting_down(),
    };
    let code = if body.synced && !body.shutting_down {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[cfg(feature = "metrics")]
pub async fn metrics() -> (StatusCode, String) {
    match crate::controller::metrics::encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, String::new())
        }
    }
}
