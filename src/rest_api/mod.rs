//! HTTP surface for health checks and metrics
//!
//! Serves liveness, readiness and the Prometheus scrape endpoint.

mod handlers;
mod server;

pub use handlers::{ApiState, HealthResponse, ReadyResponse};
pub use server::{router, run_server};
