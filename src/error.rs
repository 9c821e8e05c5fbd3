//! Error taxonomy for the ingestion pipeline.
//!
//! Only `InvalidInput`, `QueueFull` and `Closed` ever reach the ingress
//! boundary. Publish and persist failures are contained inside the worker
//! (or flush) that hit them and are logged, never propagated.

use thiserror::Error;

// ---

#[derive(Debug, Error)]
pub enum IngestError {
    // ---
    /// Structurally or physically invalid reading. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Intake queue at capacity. The producer decides whether to retry.
    #[error("intake queue is full")]
    QueueFull,

    /// The pipeline has shut down and no longer accepts readings.
    #[error("ingestion pipeline is closed")]
    Closed,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("persist failed: {0}")]
    Persist(#[from] sqlx::Error),
}

impl IngestError {
    /// True for overload conditions the caller may retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::QueueFull | IngestError::Closed)
    }
}

impl From<redis::RedisError> for IngestError {
    fn from(err: redis::RedisError) -> Self {
        IngestError::Publish(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Publish(format!("serialization: {err}"))
    }
}
