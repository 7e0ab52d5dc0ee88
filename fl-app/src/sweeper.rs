//! Periodic expiry sweep.
//!
//! Dedup, throttle, and idle-session state all carry TTLs; without this
//! pass they grow without bound and stale throttle state outlives its
//! window. Conversations holding an active dispatch lock are never
//! touched mid-flight.

use crate::ledger::DedupLedger;
use crate::locks::ConversationLocks;
use crate::session::SessionStore;
use crate::throttle::ResponseThrottle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct CleanupSweeper {
    interval: Duration,
    ledger: Arc<DedupLedger>,
    throttle: Arc<ResponseThrottle>,
    sessions: Arc<SessionStore>,
    locks: Arc<ConversationLocks>,
}

impl CleanupSweeper {
    pub fn new(
        interval: Duration,
        ledger: Arc<DedupLedger>,
        throttle: Arc<ResponseThrottle>,
        sessions: Arc<SessionStore>,
        locks: Arc<ConversationLocks>,
    ) -> Self {
        Self {
            interval,
            ledger,
            throttle,
            sessions,
            locks,
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("cleanup sweeper stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.sweep_once();
        }
    }

    pub fn sweep_once(&self) {
        let held = self.locks.active_keys();
        let (expired_ids, expired_fingerprints) = self.ledger.sweep(&held);
        let expired_throttle = self.throttle.sweep(&held);
        let evicted_sessions = self.sessions.sweep_idle(&held);
        tracing::debug!(
            expired_ids,
            expired_fingerprints,
            expired_throttle,
            evicted_sessions,
            held_locks = held.len(),
            "cleanup sweep complete"
        );
    }
}
