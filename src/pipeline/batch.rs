//! Batch accumulator.
//!
//! Workers append accepted readings here instead of writing them one at a
//! time. A single background task owns flushing: on every timer tick, as
//! soon as the batch reaches its size limit, and once more at shutdown after
//! the workers have finished their in-flight readings.
//!
//! The accumulator holds at most twice `batch_max` readings, including the
//! ones in a flush that has not completed yet. Past that, [`BatchAccumulator::push`]
//! waits, so a slow store stalls the workers instead of growing memory.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{watch, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::{cancelled, stats::PipelineStats};
use crate::{ReadingStore, SensorReading};

// ---

pub struct BatchAccumulator {
    batch: Mutex<Vec<SensorReading>>,
    full: Notify,
    slots: Semaphore,
    batch_max: usize,
}

impl BatchAccumulator {
    // ---
    pub fn new(batch_max: usize) -> Self {
        // ---
        let batch_max = batch_max.clamp(1, Semaphore::MAX_PERMITS / 2);
        Self {
            batch: Mutex::new(Vec::with_capacity(batch_max)),
            full: Notify::new(),
            slots: Semaphore::new(batch_max * 2),
            batch_max,
        }
    }

    /// Append a reading. Wakes the flusher once the batch reaches its limit,
    /// and waits while the accumulator is at capacity.
    pub async fn push(&self, reading: SensorReading) {
        // ---
        // Slots come back through `release` once the reading is written.
        // The semaphore is never closed, so `acquire` cannot fail.
        let permit = match self.slots.try_acquire() {
            Ok(permit) => Some(permit),
            Err(_) => {
                debug!("Batch accumulator at capacity, waiting for flush");
                self.full.notify_one();
                self.slots.acquire().await.ok()
            }
        };
        if let Some(permit) = permit {
            permit.forget();
        }

        let len = {
            let mut batch = self.lock();
            batch.push(reading);
            batch.len()
        };
        if len >= self.batch_max {
            self.full.notify_one();
        }
    }

    /// Take the current batch, leaving an empty one in its place.
    pub fn take(&self) -> Vec<SensorReading> {
        // ---
        let mut batch = self.lock();
        if batch.is_empty() {
            return Vec::new();
        }
        std::mem::replace(&mut *batch, Vec::with_capacity(self.batch_max))
    }

    /// Return `n` slots taken by readings that have left the accumulator.
    pub fn release(&self, n: usize) {
        self.slots.add_permits(n);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    // A panic while holding the lock cannot leave the Vec half-written.
    fn lock(&self) -> MutexGuard<'_, Vec<SensorReading>> {
        self.batch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Flush whatever is pending. Returns the number of readings handed to the
/// store.
pub(crate) async fn flush(
    accumulator: &BatchAccumulator,
    store: &dyn ReadingStore,
    stats: &PipelineStats,
) -> usize {
    // ---
    let batch = accumulator.take();
    if batch.is_empty() {
        return 0;
    }

    let outcome = store.persist_batch(&batch).await;
    accumulator.release(batch.len());
    PipelineStats::incr(&stats.batches_flushed);
    PipelineStats::add(&stats.persisted, outcome.written);
    PipelineStats::add(&stats.persist_failures, outcome.failed);

    if outcome.failed > 0 {
        error!(
            count = batch.len(),
            written = outcome.written,
            failed = outcome.failed,
            "Batch flushed with failures"
        );
    } else {
        info!(count = batch.len(), "Saved batch");
    }
    batch.len()
}

/// Timer-driven flush loop.
///
/// Exits when `shutdown` flips to `true` (or its sender is dropped). Before
/// returning it waits for every worker in `workers`, still flushing whenever
/// the batch fills so none of them stays blocked in `push`, and then performs
/// one final flush so readings appended by in-flight work are included.
pub(crate) async fn run(
    accumulator: Arc<BatchAccumulator>,
    store: Arc<dyn ReadingStore>,
    stats: Arc<PipelineStats>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    workers: Vec<JoinHandle<()>>,
) {
    // ---
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    info!(interval_ms = interval.as_millis() as u64, "Batch accumulator started");

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut shutdown) => break,
            _ = ticker.tick() => {}
            _ = accumulator.full.notified() => {
                debug!("Batch size limit reached, flushing early");
            }
        }
        flush(&accumulator, store.as_ref(), &stats).await;
    }

    debug!(workers = workers.len(), "Waiting for workers to drain");
    for mut handle in workers {
        loop {
            tokio::select! {
                joined = &mut handle => {
                    if let Err(e) = joined {
                        error!(error = %e, "Worker task failed");
                    }
                    break;
                }
                _ = accumulator.full.notified() => {
                    flush(&accumulator, store.as_ref(), &stats).await;
                }
            }
        }
    }

    let remaining = flush(&accumulator, store.as_ref(), &stats).await;
    info!(remaining, "Batch accumulator stopped");
}
