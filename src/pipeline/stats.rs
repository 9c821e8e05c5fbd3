//! Pipeline counters shared by ingress, workers and the accumulator.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// ---

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub enqueued: AtomicU64,
    pub rejected_invalid: AtomicU64,
    pub rejected_full: AtomicU64,
    pub processed: AtomicU64,
    pub filtered: AtomicU64,
    pub failed: AtomicU64,
    pub publish_failures: AtomicU64,
    pub persisted: AtomicU64,
    pub persist_failures: AtomicU64,
    pub batches_flushed: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`], served on `/health`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    pub rejected_invalid: u64,
    pub rejected_full: u64,
    pub processed: u64,
    pub filtered: u64,
    pub failed: u64,
    pub publish_failures: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub batches_flushed: u64,
}

impl PipelineStats {
    // ---
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // ---
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            enqueued: load(&self.enqueued),
            rejected_invalid: load(&self.rejected_invalid),
            rejected_full: load(&self.rejected_full),
            processed: load(&self.processed),
            filtered: load(&self.filtered),
            failed: load(&self.failed),
            publish_failures: load(&self.publish_failures),
            persisted: load(&self.persisted),
            persist_failures: load(&self.persist_failures),
            batches_flushed: load(&self.batches_flushed),
        }
    }
}
