//! Two-tier deduplication ledger.
//!
//! Admission runs three checks in order: the in-memory identifier map,
//! a durable-store lookup by identifier (covers process restarts the
//! in-memory map cannot), and the in-memory content fingerprint.
//! Gateway identifiers are sometimes missing, reused, or not yet visible
//! durably; the fingerprint is the second line of defense against
//! near-simultaneous duplicate delivery.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fl_gateway::InboundEvent;
use fl_store::{Filter, SortOrder, Store};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const PROCESSED_MESSAGES: &str = "processed_messages";

/// Leading slice of the body that feeds the content fingerprint.
const FINGERPRINT_BODY_PREFIX_CHARS: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DuplicateIdentifier,
    DuplicateFingerprint,
}

#[derive(Debug, Clone)]
pub enum Admission {
    Accepted { record_id: String },
    Rejected(RejectReason),
}

impl Admission {
    pub fn accepted(&self) -> bool {
        matches!(self, Admission::Accepted { .. })
    }
}

pub struct DedupLedger {
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    id_ttl: chrono::Duration,
    fingerprint_ttl: chrono::Duration,
    seen_ids: DashMap<String, DateTime<Utc>>,
    seen_fingerprints: DashMap<String, FingerprintEntry>,
}

struct FingerprintEntry {
    conversation_key: String,
    first_seen_at: DateTime<Utc>,
}

impl DedupLedger {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
        id_ttl: chrono::Duration,
        fingerprint_ttl: chrono::Duration,
    ) -> Self {
        Self {
            clock,
            store,
            id_ttl,
            fingerprint_ttl,
            seen_ids: DashMap::new(),
            seen_fingerprints: DashMap::new(),
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(message_id = %event.message_id))]
    pub async fn admit(&self, event: &InboundEvent) -> anyhow::Result<Admission> {
        let now = self.clock.now();
        let message_id = event.message_id.as_str();

        if let Some(first_seen) = self.seen_ids.get(message_id) {
            if now - *first_seen < self.id_ttl {
                return Ok(Admission::Rejected(RejectReason::DuplicateIdentifier));
            }
            drop(first_seen);
            self.seen_ids.remove(message_id);
        }

        let stored = self
            .store
            .filter(
                PROCESSED_MESSAGES,
                &[Filter::eq("message_id", message_id)],
                SortOrder::NewestFirst,
                1,
            )
            .await?;
        if !stored.is_empty() {
            // Re-prime the in-memory tier so the durable lookup is not
            // repeated for every redelivery burst.
            self.seen_ids.insert(message_id.to_string(), now);
            return Ok(Admission::Rejected(RejectReason::DuplicateIdentifier));
        }

        let fingerprint = content_fingerprint(event);
        if let Some(entry) = self.seen_fingerprints.get(&fingerprint) {
            if now - entry.first_seen_at < self.fingerprint_ttl {
                return Ok(Admission::Rejected(RejectReason::DuplicateFingerprint));
            }
        }

        let record = self
            .store
            .create(
                PROCESSED_MESSAGES,
                serde_json::json!({
                    "message_id": message_id,
                    "conversation_key": event.conversation_key.as_str(),
                    "gateway_id": event.source_gateway_id.as_str(),
                    "status": "accepted",
                    "observed_at": event.observed_at,
                }),
            )
            .await?;
        self.seen_ids.insert(message_id.to_string(), now);
        self.seen_fingerprints.insert(
            fingerprint,
            FingerprintEntry {
                conversation_key: event.conversation_key.to_string(),
                first_seen_at: now,
            },
        );

        Ok(Admission::Accepted {
            record_id: record.id,
        })
    }

    /// Drop expired entries from both in-memory tiers. Fingerprints for
    /// conversations in `skip_keys` are left alone.
    pub fn sweep(&self, skip_keys: &[String]) -> (usize, usize) {
        let now = self.clock.now();
        let ids_before = self.seen_ids.len();
        self.seen_ids
            .retain(|_, first_seen| now - *first_seen < self.id_ttl);

        let fingerprints_before = self.seen_fingerprints.len();
        self.seen_fingerprints.retain(|_, entry| {
            skip_keys.contains(&entry.conversation_key)
                || now - entry.first_seen_at < self.fingerprint_ttl
        });

        (
            ids_before - self.seen_ids.len(),
            fingerprints_before - self.seen_fingerprints.len(),
        )
    }
}

fn content_fingerprint(event: &InboundEvent) -> String {
    let prefix: String = event
        .body
        .chars()
        .take(FINGERPRINT_BODY_PREFIX_CHARS)
        .collect();
    let mut hasher = Sha256::new();
    hasher.update(event.conversation_key.as_bytes());
    hasher.update(b"\n");
    hasher.update(prefix.as_bytes());
    format!("{:x}", hasher.finalize())
}
