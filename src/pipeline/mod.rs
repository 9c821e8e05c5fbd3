//! Ingestion pipeline gateway (EMBP).
//!
//! Exposes the two handles the rest of the service needs:
//! - [`Ingestor`]: the producer side used by the HTTP ingress boundary
//! - [`PipelineHandle`]: the lifecycle side used by `main` at shutdown
//!
//! Internals (queue, workers, accumulator) stay private to this directory.
//!
//! # Shutdown
//! The caller flips the shared `watch` channel to `true`. Workers stop
//! taking new readings but finish the one they hold. The accumulator waits
//! for them, flushes once, and exits. Readings still queued at that point
//! are discarded and counted. If this takes longer than the grace period
//! the remaining tasks are aborted and their readings are lost.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{error, info, warn};

mod batch;
mod calibration;
mod queue;
mod stats;
mod worker;

pub use calibration::{Calibrator, IdentityCalibration};
pub use stats::StatsSnapshot;

use crate::{Config, IngestError, ReadingPublisher, ReadingStore, SensorReading};
use batch::BatchAccumulator;
use queue::{IntakeReceiver, IntakeSender};
use stats::PipelineStats;
use worker::Stages;

// ---

/// Pipeline sizing, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub flush_interval: Duration,
    pub batch_max: usize,
    pub publish_timeout: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity,
            worker_count: cfg.worker_count,
            flush_interval: cfg.flush_interval,
            batch_max: cfg.batch_max,
            publish_timeout: cfg.publish_timeout,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            worker_count: 10,
            flush_interval: Duration::from_secs(5),
            batch_max: 1_000,
            publish_timeout: Duration::from_secs(2),
        }
    }
}

/// External collaborators the pipeline talks to.
pub struct PipelineDeps {
    pub publisher: Arc<dyn ReadingPublisher>,
    pub store: Arc<dyn ReadingStore>,
    pub calibrator: Arc<dyn Calibrator>,
}

/// Producer handle. Validates at the door, then enqueues without blocking.
#[derive(Clone)]
pub struct Ingestor {
    queue: IntakeSender,
    stats: Arc<PipelineStats>,
}

impl Ingestor {
    // ---
    /// Submit one reading.
    ///
    /// Invalid readings fail with [`IngestError::InvalidInput`] and are never
    /// queued. A full queue fails immediately with [`IngestError::QueueFull`].
    pub fn submit(&self, mut reading: SensorReading) -> Result<(), IngestError> {
        // ---
        if let Err(e) = reading.validate() {
            PipelineStats::incr(&self.stats.rejected_invalid);
            return Err(e);
        }

        match self.queue.enqueue(reading) {
            Ok(()) => {
                PipelineStats::incr(&self.stats.enqueued);
                Ok(())
            }
            Err(e) => {
                if matches!(e, IngestError::QueueFull) {
                    PipelineStats::incr(&self.stats.rejected_full);
                }
                Err(e)
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.depth()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Lifecycle handle returned by [`start`].
pub struct PipelineHandle {
    accumulator: JoinHandle<()>,
    workers: Vec<AbortHandle>,
    queue: IntakeReceiver,
}

impl PipelineHandle {
    // ---
    /// Wait for the pipeline to drain after the shutdown signal has fired.
    ///
    /// Returns an error if `grace` elapses first; in that case the remaining
    /// tasks are aborted and their in-flight readings are abandoned.
    pub async fn wait(self, grace: Duration) -> Result<()> {
        // ---
        let PipelineHandle {
            mut accumulator,
            workers,
            queue,
        } = self;

        let drained = tokio::time::timeout(grace, &mut accumulator).await;

        let discarded = queue.close_and_discard().await;
        if discarded > 0 {
            warn!(discarded, "Dropped readings still queued at shutdown");
        }

        match drained {
            Ok(Ok(())) => {
                info!("Pipeline drained");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow!("Batch accumulator task failed: {}", e)),
            Err(_) => {
                accumulator.abort();
                for worker in &workers {
                    worker.abort();
                }
                error!(
                    grace_secs = grace.as_secs(),
                    "Pipeline did not drain in time, abandoning in-flight work"
                );
                Err(anyhow!("Pipeline did not drain within {:?}", grace))
            }
        }
    }
}

/// Spawn the worker pool and the batch accumulator.
///
/// Returns immediately. Must be called from within a tokio runtime.
pub fn start(
    settings: PipelineSettings,
    deps: PipelineDeps,
    shutdown: watch::Receiver<bool>,
) -> (Ingestor, PipelineHandle) {
    // ---
    let (tx, rx) = queue::intake_queue(settings.queue_capacity);
    let stats = Arc::new(PipelineStats::default());
    let accumulator = Arc::new(BatchAccumulator::new(settings.batch_max));

    let stages = Arc::new(Stages {
        calibrator: deps.calibrator,
        publisher: deps.publisher,
        accumulator: accumulator.clone(),
        stats: stats.clone(),
        publish_timeout: settings.publish_timeout,
    });

    let workers = worker::spawn_pool(
        settings.worker_count.max(1),
        rx.clone(),
        stages,
        shutdown.clone(),
    );
    let worker_aborts = workers.iter().map(JoinHandle::abort_handle).collect();

    let accumulator = tokio::spawn(batch::run(
        accumulator,
        deps.store,
        stats.clone(),
        settings.flush_interval,
        shutdown,
        workers,
    ));

    info!(
        workers = settings.worker_count,
        queue_capacity = settings.queue_capacity,
        "Starting sensor data ingestor"
    );

    (
        Ingestor { queue: tx, stats },
        PipelineHandle {
            accumulator,
            workers: worker_aborts,
            queue: rx,
        },
    )
}

/// Resolves once `shutdown` reads `true` or its sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    // ---
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::SOURCE_LABEL;
    use crate::testing::{sample_reading, HangingPublisher, MemoryPublisher, MemoryStore};
    use std::collections::HashSet;

    struct Harness {
        ingestor: Ingestor,
        handle: PipelineHandle,
        shutdown: watch::Sender<bool>,
        publisher: Arc<MemoryPublisher>,
        store: Arc<MemoryStore>,
    }

    fn harness(settings: PipelineSettings) -> Harness {
        // ---
        let publisher = Arc::new(MemoryPublisher::default());
        let store = Arc::new(MemoryStore::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ingestor, handle) = start(
            settings,
            PipelineDeps {
                publisher: publisher.clone(),
                store: store.clone(),
                calibrator: Arc::new(IdentityCalibration),
            },
            shutdown_rx,
        );
        Harness {
            ingestor,
            handle,
            shutdown,
            publisher,
            store,
        }
    }

    fn slow_flush() -> PipelineSettings {
        // ---
        PipelineSettings {
            worker_count: 4,
            flush_interval: Duration::from_secs(3600),
            batch_max: 10_000,
            ..PipelineSettings::default()
        }
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        // ---
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_end_to_end_single_reading() {
        // ---
        let h = harness(slow_flush());
        let mut reading = sample_reading("s1");
        reading.latitude = 22.3;
        reading.longitude = 114.2;
        reading.temperature = 25.0;
        reading.humidity = 60.0;
        reading.timestamp = Some(chrono::Utc::now());

        h.ingestor.submit(reading).unwrap();
        wait_until(|| h.ingestor.stats().processed == 1).await;

        h.shutdown.send(true).unwrap();
        h.handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(h.publisher.sensor_ids(), vec!["s1"]);
        let rows = h.store.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sensor_id, "s1");
        assert_eq!(rows[0].source, SOURCE_LABEL);
        assert_eq!(rows[0].point, (114.2, 22.3, 12.0));
        assert_eq!(rows[0].confidence, 0.8);
        assert!(rows[0].timestamp.is_some());
        assert_eq!(h.store.batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_reading_rejected_at_ingress() {
        // ---
        let h = harness(slow_flush());
        let mut bad = sample_reading("s1");
        bad.longitude = 200.0;

        let err = h.ingestor.submit(bad).unwrap_err();
        assert!(matches!(err, IngestError::InvalidInput(_)));
        assert_eq!(h.ingestor.queue_depth(), 0);
        assert_eq!(h.ingestor.stats().rejected_invalid, 1);

        h.shutdown.send(true).unwrap();
        h.handle.wait(Duration::from_secs(5)).await.unwrap();
        assert!(h.store.rows().is_empty());
    }

    #[tokio::test]
    async fn test_filtered_reading_never_published_or_persisted() {
        // ---
        let h = harness(slow_flush());
        let mut hot = sample_reading("hot");
        hot.temperature = 61.0;

        h.ingestor.submit(hot).unwrap();
        wait_until(|| h.ingestor.stats().filtered == 1).await;

        h.shutdown.send(true).unwrap();
        h.handle.wait(Duration::from_secs(5)).await.unwrap();
        assert!(h.publisher.sensor_ids().is_empty());
        assert!(h.store.rows().is_empty());
        assert_eq!(h.ingestor.stats().failed, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_each_reading_processed_once() {
        // ---
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 250;

        let h = harness(PipelineSettings {
            batch_max: 64,
            flush_interval: Duration::from_millis(10),
            ..slow_flush()
        });

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ingestor = h.ingestor.clone();
                tokio::spawn(async move {
                    for i in 0..PER_PRODUCER {
                        ingestor.submit(sample_reading(&format!("p{p}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.await.unwrap();
        }

        let total = (PRODUCERS * PER_PRODUCER) as u64;
        wait_until(|| h.ingestor.stats().processed == total).await;

        h.shutdown.send(true).unwrap();
        h.handle.wait(Duration::from_secs(5)).await.unwrap();

        let ids = h.store.sensor_ids();
        assert_eq!(ids.len(), total as usize);
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), total as usize);
        assert_eq!(h.publisher.sensor_ids().len(), total as usize);
        assert_eq!(h.ingestor.stats().persisted, total);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_blocking() {
        // ---
        // Cancel before any worker can drain, so the queue stays full.
        let publisher = Arc::new(MemoryPublisher::default());
        let store = Arc::new(MemoryStore::default());
        let (shutdown, shutdown_rx) = watch::channel(true);
        let (ingestor, handle) = start(
            PipelineSettings {
                queue_capacity: 2,
                ..slow_flush()
            },
            PipelineDeps {
                publisher,
                store: store.clone(),
                calibrator: Arc::new(IdentityCalibration),
            },
            shutdown_rx,
        );

        ingestor.submit(sample_reading("a")).unwrap();
        ingestor.submit(sample_reading("b")).unwrap();
        let err = ingestor.submit(sample_reading("c")).unwrap_err();
        assert!(matches!(err, IngestError::QueueFull));
        assert_eq!(ingestor.stats().rejected_full, 1);

        handle.wait(Duration::from_secs(5)).await.unwrap();
        drop(shutdown);

        // Queued readings are discarded at shutdown, and the queue is closed.
        assert!(store.rows().is_empty());
        assert!(matches!(
            ingestor.submit(sample_reading("d")),
            Err(IngestError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_accepted_readings() {
        // ---
        let h = harness(slow_flush());
        for id in ["a", "b", "c"] {
            h.ingestor.submit(sample_reading(id)).unwrap();
        }
        wait_until(|| h.ingestor.stats().processed == 3).await;
        assert_eq!(h.store.batch_calls(), 0);

        h.shutdown.send(true).unwrap();
        h.handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(h.store.batch_calls(), 1);
        assert_eq!(h.store.rows().len(), 3);
    }

    #[tokio::test]
    async fn test_stalled_broker_does_not_block_persistence() {
        // ---
        let store = Arc::new(MemoryStore::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ingestor, handle) = start(
            PipelineSettings {
                worker_count: 2,
                publish_timeout: Duration::from_millis(50),
                ..slow_flush()
            },
            PipelineDeps {
                publisher: Arc::new(HangingPublisher),
                store: store.clone(),
                calibrator: Arc::new(IdentityCalibration),
            },
            shutdown_rx,
        );

        for i in 0..5 {
            ingestor.submit(sample_reading(&format!("s{i}"))).unwrap();
        }
        wait_until(|| ingestor.stats().processed == 5).await;

        shutdown.send(true).unwrap();
        handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(store.rows().len(), 5);
        assert_eq!(ingestor.stats().publish_failures, 5);
    }

    #[tokio::test]
    async fn test_grace_timeout_aborts_workers() {
        // ---
        let publisher = Arc::new(MemoryPublisher::with_delay(Duration::from_millis(300)));
        let store = Arc::new(MemoryStore::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (ingestor, handle) = start(
            PipelineSettings {
                worker_count: 2,
                publish_timeout: Duration::from_secs(5),
                ..slow_flush()
            },
            PipelineDeps {
                publisher: publisher.clone(),
                store: store.clone(),
                calibrator: Arc::new(IdentityCalibration),
            },
            shutdown_rx,
        );

        ingestor.submit(sample_reading("a")).unwrap();
        ingestor.submit(sample_reading("b")).unwrap();
        wait_until(|| ingestor.queue_depth() == 0).await;

        shutdown.send(true).unwrap();
        assert!(handle.wait(Duration::from_millis(50)).await.is_err());

        // Aborted workers never finish their publish.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(publisher.sensor_ids().is_empty());
        assert_eq!(ingestor.stats().processed, 0);
        assert!(store.rows().is_empty());
    }
}
