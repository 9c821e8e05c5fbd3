use axum::Router;

use crate::Ingestor;

mod health;
mod ingest;

// ---

pub fn router(ingestor: Ingestor) -> Router {
    // ---
    Router::new()
        .merge(ingest::router())
        .merge(health::router())
        .with_state(ingestor)
}
