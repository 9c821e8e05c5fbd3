//! Bounded intake queue between the ingress boundary and the workers.
//!
//! Producers never wait: a full queue rejects the reading on the spot.
//! Consumers share one receiver behind an async mutex so that any idle
//! worker can take the next reading.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::{IngestError, SensorReading};

// ---

/// Producer half. Cheap to clone, one per request handler if needed.
#[derive(Clone)]
pub struct IntakeSender {
    tx: mpsc::Sender<SensorReading>,
}

/// Consumer half shared by every worker in the pool.
#[derive(Clone)]
pub struct IntakeReceiver {
    rx: Arc<Mutex<mpsc::Receiver<SensorReading>>>,
}

/// Create a queue holding at most `capacity` readings.
pub fn intake_queue(capacity: usize) -> (IntakeSender, IntakeReceiver) {
    // ---
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        IntakeSender { tx },
        IntakeReceiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

impl IntakeSender {
    // ---
    /// Hand a reading to the pipeline without blocking.
    pub fn enqueue(&self, reading: SensorReading) -> Result<(), IngestError> {
        // ---
        self.tx.try_send(reading).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => IngestError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => IngestError::Closed,
        })
    }

    /// Readings currently waiting for a worker.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl IntakeReceiver {
    // ---
    /// Wait for the next reading. Returns `None` once every sender is gone
    /// and the queue is empty. Cancel safe.
    pub async fn dequeue(&self) -> Option<SensorReading> {
        // ---
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Stop accepting new readings and discard whatever is still queued.
    /// Returns how many readings were discarded.
    pub async fn close_and_discard(&self) -> usize {
        // ---
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}
