//! Real-time publisher.
//!
//! Accepted readings are serialized to JSON and published on a Redis
//! pub/sub channel. The fan-out hub subscribed to that channel owns delivery
//! to live clients; this side is fire-and-forget.

use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};

use crate::{IngestError, SensorReading};

// ---

/// Seam between the worker pool and the real-time transport.
#[async_trait]
pub trait ReadingPublisher: Send + Sync {
    /// Publish one accepted reading. Failures are reported, never retried.
    async fn publish(&self, reading: &SensorReading) -> Result<(), IngestError>;
}

/// Publishes readings with `PUBLISH` over a shared multiplexed connection.
pub struct RedisPublisher {
    conn: MultiplexedConnection,
    channel: String,
}

impl RedisPublisher {
    // ---
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(redis_url: &str, channel: &str) -> Result<Self, IngestError> {
        // ---
        let client = Client::open(redis_url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            conn,
            channel: channel.to_string(),
        })
    }
}

#[async_trait]
impl ReadingPublisher for RedisPublisher {
    async fn publish(&self, reading: &SensorReading) -> Result<(), IngestError> {
        // ---
        let payload = serde_json::to_string(reading)?;

        // Cloning a multiplexed connection shares the underlying socket.
        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(&self.channel, payload).await?;

        tracing::trace!(
            sensor_id = %reading.sensor_id,
            channel = %self.channel,
            receivers,
            "Published reading"
        );
        Ok(())
    }
}
