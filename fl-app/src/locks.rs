//! Per-conversation dispatch locks.
//!
//! Acquisition is exclusive; a held lock auto-expires after the safety
//! timeout so a crashed worker cannot starve its conversation forever.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fl_gateway::ConversationKey;
use std::sync::Arc;

pub struct ConversationLocks {
    clock: Arc<dyn Clock>,
    timeout: chrono::Duration,
    held: DashMap<ConversationKey, DateTime<Utc>>,
}

impl ConversationLocks {
    pub fn new(clock: Arc<dyn Clock>, timeout: chrono::Duration) -> Self {
        Self {
            clock,
            timeout,
            held: DashMap::new(),
        }
    }

    pub fn try_acquire(&self, key: &ConversationKey) -> bool {
        let now = self.clock.now();
        match self.held.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now - *occupied.get() < self.timeout {
                    return false;
                }
                tracing::warn!(
                    conversation_key = %key,
                    "reclaiming expired conversation lock"
                );
                occupied.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    pub fn release(&self, key: &ConversationKey) {
        self.held.remove(key);
    }

    pub fn is_locked(&self, key: &ConversationKey) -> bool {
        match self.held.get(key) {
            Some(acquired_at) => self.clock.now() - *acquired_at < self.timeout,
            None => false,
        }
    }

    pub fn active_keys(&self) -> Vec<String> {
        let now = self.clock.now();
        self.held
            .iter()
            .filter(|entry| now - *entry.value() < self.timeout)
            .map(|entry| entry.key().to_string())
            .collect()
    }
}
