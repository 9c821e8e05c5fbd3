//! Ingress boundary: `POST /ingest`.
//!
//! Decodes one reading, hands it to the pipeline and answers right away.
//! Nothing here waits for processing; `202 Accepted` only means the reading
//! is queued.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{IngestError, Ingestor, SensorReading};

// ---

/// Seconds a client should back off after an overload response.
const RETRY_AFTER_SECS: &str = "1";

pub fn router() -> Router<Ingestor> {
    // ---
    Router::new().route("/ingest", post(handler))
}

async fn handler(State(ingestor): State<Ingestor>, Json(reading): Json<SensorReading>) -> Response {
    // ---
    let request_id = Uuid::new_v4();
    let sensor_id = reading.sensor_id.clone();

    match ingestor.submit(reading) {
        Ok(()) => {
            debug!(%request_id, %sensor_id, "Reading queued");
            (StatusCode::ACCEPTED, "Accepted").into_response()
        }
        Err(e) if e.is_transient() => {
            warn!(%request_id, %sensor_id, error = %e, "Pipeline overloaded, reading rejected");
            e.into_response()
        }
        Err(e) => {
            debug!(%request_id, %sensor_id, error = %e, "Reading rejected");
            e.into_response()
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        // ---
        match self {
            IngestError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            IngestError::QueueFull | IngestError::Closed => (
                StatusCode::SERVICE_UNAVAILABLE,
                [(header::RETRY_AFTER, RETRY_AFTER_SECS)],
                self.to_string(),
            )
                .into_response(),
            IngestError::Publish(_) | IngestError::Persist(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}
