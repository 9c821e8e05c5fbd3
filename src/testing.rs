//! In-memory doubles for the publisher and store seams, shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use crate::store::{write_chunked, ReadingRow};
use crate::{BatchOutcome, IngestError, ReadingPublisher, ReadingStore, SensorReading};

// ---

/// A plausible, valid reading from Hong Kong.
pub fn sample_reading(sensor_id: &str) -> SensorReading {
    // ---
    SensorReading {
        sensor_id: sensor_id.to_string(),
        user_id: None,
        timestamp: Some(Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap()),
        latitude: 22.3,
        longitude: 114.2,
        elevation: 12.0,
        temperature: 25.0,
        humidity: 60.0,
        rainfall: 0.0,
        wind_speed: 3.1,
        wind_direction: 90.0,
        pressure: 1009.5,
        device_type: "esp32".to_string(),
        accuracy: 0.8,
    }
}

#[derive(Default)]
pub struct MemoryPublisher {
    published: Mutex<Vec<String>>,
    fail: bool,
    delay: Option<Duration>,
}

impl MemoryPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// A publisher that takes `delay` before each reading is recorded.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn sensor_ids(&self) -> Vec<String> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReadingPublisher for MemoryPublisher {
    async fn publish(&self, reading: &SensorReading) -> Result<(), IngestError> {
        if self.fail {
            return Err(IngestError::Publish("broker unavailable".into()));
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        // Serialize like the real publisher would.
        serde_json::to_string(reading)?;
        self.published.lock().unwrap().push(reading.sensor_id.clone());
        Ok(())
    }
}

/// Never answers, like a broker that accepted the connection and stalled.
pub struct HangingPublisher;

#[async_trait]
impl ReadingPublisher for HangingPublisher {
    async fn publish(&self, _reading: &SensorReading) -> Result<(), IngestError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// A row as the storage engine would see it.
#[derive(Debug, Clone)]
pub struct StoredRow {
    pub sensor_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub point: (f64, f64, f64),
    pub source: &'static str,
    pub confidence: f64,
}

impl From<ReadingRow<'_>> for StoredRow {
    fn from(row: ReadingRow<'_>) -> Self {
        Self {
            sensor_id: row.sensor_id.to_string(),
            timestamp: row.timestamp,
            point: row.point,
            source: row.source,
            confidence: row.confidence,
        }
    }
}

/// Store double that goes through the same row mapping and chunk-and-retry
/// path as the Postgres writer. A chunk fails as a whole, like one INSERT.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<Vec<StoredRow>>,
    batch_calls: AtomicUsize,
    fail_sensor: Option<String>,
    delay: Option<Duration>,
}

impl MemoryStore {
    /// A store that rejects every reading from `sensor_id`.
    pub fn failing_for(sensor_id: &str) -> Self {
        Self {
            fail_sensor: Some(sensor_id.to_string()),
            ..Self::default()
        }
    }

    /// A store whose batch writes take `delay` to complete.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn rows(&self) -> Vec<StoredRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn sensor_ids(&self) -> Vec<String> {
        self.rows().into_iter().map(|r| r.sensor_id).collect()
    }

    /// Number of `persist_batch` calls started so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn insert(&self, readings: &[SensorReading]) -> Result<(), IngestError> {
        // ---
        let rejected = readings
            .iter()
            .any(|r| self.fail_sensor.as_deref() == Some(r.sensor_id.as_str()));
        if rejected {
            return Err(IngestError::Persist(sqlx::Error::RowNotFound));
        }
        let mut rows = self.rows.lock().unwrap();
        rows.extend(readings.iter().map(|r| StoredRow::from(ReadingRow::from(r))));
        Ok(())
    }
}

#[async_trait]
impl ReadingStore for MemoryStore {
    async fn persist(&self, reading: &SensorReading) -> Result<(), IngestError> {
        self.insert(std::slice::from_ref(reading))
    }

    async fn persist_batch(&self, readings: &[SensorReading]) -> BatchOutcome {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        write_chunked(readings, usize::MAX, |chunk| {
            std::future::ready(self.insert(chunk))
        })
        .await
    }
}
