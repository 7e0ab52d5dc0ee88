use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime pipeline counters, surfaced on the health endpoint.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub admitted: AtomicU64,
    pub rejected_duplicate: AtomicU64,
    pub discarded: AtomicU64,
    pub replied: AtomicU64,
    pub suppressed: AtomicU64,
    pub failed: AtomicU64,
    pub fallbacks_sent: AtomicU64,
    pub poll_cycles: AtomicU64,
    pub poll_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatsSnapshot {
    pub admitted: u64,
    pub rejected_duplicate: u64,
    pub discarded: u64,
    pub replied: u64,
    pub suppressed: u64,
    pub failed: u64,
    pub fallbacks_sent: u64,
    pub poll_cycles: u64,
    pub poll_failures: u64,
}

impl PipelineStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected_duplicate: self.rejected_duplicate.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fallbacks_sent: self.fallbacks_sent.load(Ordering::Relaxed),
            poll_cycles: self.poll_cycles.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
        }
    }
}
