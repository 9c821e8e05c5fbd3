//! Persistence writer for accepted readings.
//!
//! Rows land in the `weather_readings` table of a PostGIS-enabled database.
//! The table itself is owned by the storage service's migrations; this
//! module only writes to it.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, error, warn};

use crate::{IngestError, SensorReading};

// ---

/// Provenance label attached to every row written by this service.
pub const SOURCE_LABEL: &str = "crowdsourced";

/// Result of a best-effort batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub written: usize,
    pub failed: usize,
}

/// Seam between the batch accumulator and the storage engine.
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Write a single reading.
    async fn persist(&self, reading: &SensorReading) -> Result<(), IngestError>;

    /// Write a batch of readings. One reading's failure never prevents the
    /// others from being attempted; failures are counted, not returned.
    async fn persist_batch(&self, readings: &[SensorReading]) -> BatchOutcome;
}

/// Column values of one `weather_readings` row, in insert order.
///
/// Latitude, longitude and elevation are folded into a single `POINT Z`
/// in WGS84, stored as `(longitude, latitude, elevation)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingRow<'a> {
    pub timestamp: Option<DateTime<Utc>>,
    pub point: (f64, f64, f64),
    pub temperature: f64,
    pub humidity: f64,
    pub rainfall: f64,
    pub wind_speed: f64,
    pub wind_direction: f64,
    pub pressure: f64,
    pub source: &'static str,
    pub confidence: f64,
    pub sensor_id: &'a str,
}

impl<'a> From<&'a SensorReading> for ReadingRow<'a> {
    fn from(r: &'a SensorReading) -> Self {
        // ---
        Self {
            timestamp: r.timestamp,
            point: (r.longitude, r.latitude, r.elevation),
            temperature: r.temperature,
            humidity: r.humidity,
            rainfall: r.rainfall,
            wind_speed: r.wind_speed,
            wind_direction: r.wind_direction,
            pressure: r.pressure,
            source: SOURCE_LABEL,
            confidence: r.accuracy,
            sensor_id: &r.sensor_id,
        }
    }
}

/// Write `readings` in chunks of at most `max_rows` through `insert`.
///
/// A chunk that fails is retried one reading at a time, so a single bad
/// reading only costs itself. Readings that still fail are logged and
/// counted.
pub(crate) async fn write_chunked<'a, F, Fut, E>(
    readings: &'a [SensorReading],
    max_rows: usize,
    mut insert: F,
) -> BatchOutcome
where
    F: FnMut(&'a [SensorReading]) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Display,
{
    // ---
    let mut outcome = BatchOutcome::default();

    for chunk in readings.chunks(max_rows.max(1)) {
        match insert(chunk).await {
            Ok(()) => {
                debug!(count = chunk.len(), "Bulk insert complete");
                outcome.written += chunk.len();
            }
            Err(e) => {
                warn!(
                    count = chunk.len(),
                    error = %e,
                    "Bulk insert failed, retrying rows individually"
                );
                for reading in chunk {
                    match insert(std::slice::from_ref(reading)).await {
                        Ok(()) => outcome.written += 1,
                        Err(e) => {
                            error!(
                                sensor_id = %reading.sensor_id,
                                error = %e,
                                "Failed to save reading"
                            );
                            outcome.failed += 1;
                        }
                    }
                }
            }
        }
    }

    outcome
}

/// PostgreSQL writer using multi-row `INSERT` statements.
#[derive(Clone)]
pub struct PgReadingStore {
    pool: PgPool,
    max_rows_per_statement: usize,
}

const BINDS_PER_ROW: usize = 13;

const INSERT_PREFIX: &str = "INSERT INTO weather_readings (\
    timestamp, location, temperature, humidity, rainfall, \
    wind_speed, wind_direction, pressure, source, confidence, sensor_id) ";

impl PgReadingStore {
    // ---
    /// `max_rows_per_statement` bounds the bind parameters of one bulk
    /// INSERT (13 per row, Postgres allows 65535).
    pub fn new(pool: PgPool, max_rows_per_statement: usize) -> Self {
        // ---
        let limit = u16::MAX as usize / BINDS_PER_ROW;
        Self {
            pool,
            max_rows_per_statement: max_rows_per_statement.clamp(1, limit),
        }
    }

    async fn insert_many(&self, readings: &[SensorReading]) -> Result<(), sqlx::Error> {
        // ---
        let mut builder = build_insert(readings);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}

/// Build one `INSERT ... VALUES (...), (...)` statement for `readings`.
fn build_insert(readings: &[SensorReading]) -> QueryBuilder<'_, Postgres> {
    // ---
    let mut builder = QueryBuilder::new(INSERT_PREFIX);
    builder.push_values(readings.iter().map(ReadingRow::from), |mut row, r| {
        let (lon, lat, elev) = r.point;
        row.push_bind(r.timestamp)
            .push("ST_SetSRID(ST_MakePoint(")
            .push_bind_unseparated(lon)
            .push_unseparated(", ")
            .push_bind_unseparated(lat)
            .push_unseparated(", ")
            .push_bind_unseparated(elev)
            .push_unseparated("), 4326)")
            .push_bind(r.temperature)
            .push_bind(r.humidity)
            .push_bind(r.rainfall)
            .push_bind(r.wind_speed)
            .push_bind(r.wind_direction)
            .push_bind(r.pressure)
            .push_bind(r.source)
            .push_bind(r.confidence)
            .push_bind(r.sensor_id);
    });
    builder
}

#[async_trait]
impl ReadingStore for PgReadingStore {
    async fn persist(&self, reading: &SensorReading) -> Result<(), IngestError> {
        // ---
        self.insert_many(std::slice::from_ref(reading)).await?;
        Ok(())
    }

    async fn persist_batch(&self, readings: &[SensorReading]) -> BatchOutcome {
        // ---
        write_chunked(readings, self.max_rows_per_statement, |chunk| {
            self.insert_many(chunk)
        })
        .await
    }
}
