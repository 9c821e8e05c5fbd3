// src/routes/health.rs
//! Health check endpoint for the ingestion service.
//!
//! `/health` is used by container orchestrators to verify that the service
//! is running. Besides the static status it reports intake queue pressure
//! and the pipeline counters, all read from memory: the endpoint never
//! touches the database or the broker.
//!
//! EMBP: the handler stays private; the gateway (`mod.rs`) merges the
//! subrouter returned by [`router`].

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::{Ingestor, StatsSnapshot};

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    queue_depth: usize,
    queue_capacity: usize,
    stats: StatsSnapshot,
}

/// Handle `GET /health`.
async fn health(State(ingestor): State<Ingestor>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queue_depth: ingestor.queue_depth(),
        queue_capacity: ingestor.queue_capacity(),
        stats: ingestor.stats(),
    })
}

/// Create a subrouter containing the `/health` route.
pub fn router() -> Router<Ingestor> {
    Router::new().route("/health", get(health))
}
