//! Calibration stage.
//!
//! Runs between validation and filtering. Device-specific correction curves
//! would come from a calibration store; until one exists every reading
//! passes through untouched.

use crate::SensorReading;

// ---

/// Transform applied to each validated reading. Implementations must not
/// share mutable state across workers without their own synchronization.
pub trait Calibrator: Send + Sync {
    fn calibrate(&self, reading: SensorReading) -> SensorReading;
}

/// Pass-through calibration.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCalibration;

impl Calibrator for IdentityCalibration {
    fn calibrate(&self, reading: SensorReading) -> SensorReading {
        reading
    }
}
