//! Worker pool.
//!
//! Each worker pulls one reading at a time off the intake queue and runs it
//! through validate, calibrate, filter, publish and persist. A failing
//! reading is logged and skipped; the worker keeps going.
//!
//! An accepted reading goes to the batch accumulator before it is published,
//! and each publish is time-boxed, so a stalled broker cannot hold back
//! persistence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    batch::BatchAccumulator, calibration::Calibrator, cancelled, queue::IntakeReceiver,
    stats::PipelineStats,
};
use crate::{IngestError, ReadingPublisher, SensorReading};

// ---

/// Terminal disposition of a reading that made it through a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Published (best effort) and handed to the batch accumulator.
    Accepted,
    /// Valid but outside the plausible range. Dropped, not an error.
    FilteredOut,
}

/// Everything a worker needs, shared across the pool.
pub(crate) struct Stages {
    pub calibrator: Arc<dyn Calibrator>,
    pub publisher: Arc<dyn ReadingPublisher>,
    pub accumulator: Arc<BatchAccumulator>,
    pub stats: Arc<PipelineStats>,
    pub publish_timeout: Duration,
}

impl Stages {
    // ---
    /// Run one reading through the full pipeline.
    pub async fn process(&self, mut reading: SensorReading) -> Result<Disposition, IngestError> {
        // ---
        reading.validate()?;

        let reading = self.calibrator.calibrate(reading);

        if !reading.is_plausible() {
            warn!(
                sensor_id = %reading.sensor_id,
                temperature = reading.temperature,
                humidity = reading.humidity,
                "Filtered out invalid reading"
            );
            return Ok(Disposition::FilteredOut);
        }

        self.accumulator.push(reading.clone()).await;

        match tokio::time::timeout(self.publish_timeout, self.publisher.publish(&reading)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                PipelineStats::incr(&self.stats.publish_failures);
                error!(sensor_id = %reading.sensor_id, error = %e, "Failed to publish reading");
            }
            Err(_) => {
                PipelineStats::incr(&self.stats.publish_failures);
                error!(
                    sensor_id = %reading.sensor_id,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "Publish timed out"
                );
            }
        }

        Ok(Disposition::Accepted)
    }
}

/// Spawn `count` workers draining `queue` until `shutdown` fires.
pub(crate) fn spawn_pool(
    count: usize,
    queue: IntakeReceiver,
    stages: Arc<Stages>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    // ---
    (0..count)
        .map(|id| {
            tokio::spawn(run_worker(
                id,
                queue.clone(),
                stages.clone(),
                shutdown.clone(),
            ))
        })
        .collect()
}

async fn run_worker(
    id: usize,
    queue: IntakeReceiver,
    stages: Arc<Stages>,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    debug!(worker = id, "Starting worker");

    loop {
        // Only the wait for work is cancellable; a dequeued reading always
        // runs to completion.
        let reading = tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            next = queue.dequeue() => match next {
                Some(reading) => reading,
                None => break,
            },
        };

        let sensor_id = reading.sensor_id.clone();
        match stages.process(reading).await {
            Ok(Disposition::Accepted) => PipelineStats::incr(&stages.stats.processed),
            Ok(Disposition::FilteredOut) => PipelineStats::incr(&stages.stats.filtered),
            Err(e) => {
                PipelineStats::incr(&stages.stats.failed);
                error!(worker = id, sensor_id = %sensor_id, error = %e, "Failed to process reading");
            }
        }
    }

    info!(worker = id, "Worker stopping");
}
