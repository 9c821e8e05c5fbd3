//! Data model for crowdsourced sensor readings, plus the two per-reading
//! checks that run before a reading is published: hard validation and the
//! sanity-range filter.

use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::IngestError;

// ---

/// Accuracy assigned when a device reports none.
pub const DEFAULT_ACCURACY: f64 = 0.5;

const LATITUDE_RANGE: RangeInclusive<f64> = -90.0..=90.0;
const LONGITUDE_RANGE: RangeInclusive<f64> = -180.0..=180.0;

/// Plausible air temperature in °C. Outside this the reading is filtered.
pub const TEMPERATURE_RANGE_C: RangeInclusive<f64> = -50.0..=60.0;

/// Plausible relative humidity in %.
pub const HUMIDITY_RANGE_PCT: RangeInclusive<f64> = 0.0..=100.0;

/// One measurement event as submitted by a device.
///
/// Every field except `sensor_id` is optional on the wire and defaults to
/// its zero value, so a missing `sensor_id` surfaces as a validation
/// failure rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    // ---
    #[serde(default)]
    pub sensor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub elevation: f64,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub humidity: f64,
    #[serde(default)]
    pub rainfall: f64,
    #[serde(default)]
    pub wind_speed: f64,
    #[serde(default)]
    pub wind_direction: f64,
    #[serde(default)]
    pub pressure: f64,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub accuracy: f64,
}

impl SensorReading {
    // ---
    /// Check identity and coordinates, then fill in defaults.
    ///
    /// Rules are applied in order and the first failure wins. A missing
    /// timestamp becomes the current time and a zero accuracy becomes
    /// [`DEFAULT_ACCURACY`]. Calling this again on a validated reading
    /// changes nothing.
    pub fn validate(&mut self) -> Result<(), IngestError> {
        // ---
        if self.sensor_id.is_empty() {
            return Err(IngestError::InvalidInput("sensor_id is required".into()));
        }
        if !LATITUDE_RANGE.contains(&self.latitude) {
            return Err(IngestError::InvalidInput(format!(
                "invalid latitude: {}",
                self.latitude
            )));
        }
        if !LONGITUDE_RANGE.contains(&self.longitude) {
            return Err(IngestError::InvalidInput(format!(
                "invalid longitude: {}",
                self.longitude
            )));
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        if self.accuracy == 0.0 {
            self.accuracy = DEFAULT_ACCURACY;
        }
        Ok(())
    }

    /// Sanity-range filter applied after calibration. A `false` result is a
    /// normal outcome, not an error.
    pub fn is_plausible(&self) -> bool {
        // ---
        TEMPERATURE_RANGE_C.contains(&self.temperature)
            && HUMIDITY_RANGE_PCT.contains(&self.humidity)
    }
}
