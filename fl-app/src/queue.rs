//! Per-conversation work queue.
//!
//! At most one pending entry per conversation: rapid consecutive messages
//! from one sender merge into the existing entry, and a stale backlogged
//! entry is superseded in place. Dequeue preserves FIFO order across
//! conversations while skipping any conversation currently being
//! dispatched.

use crate::clock::Clock;
use crate::locks::ConversationLocks;
use chrono::{DateTime, Utc};
use fl_gateway::{ConversationKey, InboundEvent, MessageId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub conversation_key: ConversationKey,
    pub aggregated_body: String,
    pub message_ids: Vec<MessageId>,
    /// Durable processed-message records backing this entry; their status
    /// is resolved when dispatch completes.
    pub record_ids: Vec<String>,
    pub first_event_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    Aggregated,
    Superseded,
}

pub struct ConversationQueue {
    clock: Arc<dyn Clock>,
    aggregation_window: chrono::Duration,
    inner: Mutex<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    order: VecDeque<ConversationKey>,
    entries: HashMap<ConversationKey, QueueEntry>,
}

impl ConversationQueue {
    pub fn new(clock: Arc<dyn Clock>, aggregation_window: chrono::Duration) -> Self {
        Self {
            clock,
            aggregation_window,
            inner: Mutex::new(QueueInner::default()),
        }
    }

    /// Queue updates never leave partial state behind, so a poisoned lock
    /// still wraps a consistent queue and is safe to re-enter.
    fn inner(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn enqueue(&self, event: &InboundEvent, record_id: String) -> EnqueueOutcome {
        let now = self.clock.now();
        let mut inner = self.inner();
        let key = event.conversation_key.clone();

        match inner.entries.get_mut(&key) {
            Some(entry) if now - entry.enqueued_at <= self.aggregation_window => {
                entry.aggregated_body.push('\n');
                entry.aggregated_body.push_str(&event.body);
                entry.message_ids.push(event.message_id.clone());
                entry.record_ids.push(record_id);
                EnqueueOutcome::Aggregated
            }
            Some(entry) => {
                // Backlogged entry past the aggregation window: the new
                // message takes over its queue slot. The superseded
                // records stay attached so their outcome is still
                // resolved at dispatch time.
                entry.aggregated_body = event.body.clone();
                entry.message_ids.push(event.message_id.clone());
                entry.record_ids.push(record_id);
                entry.first_event_at = event.observed_at;
                entry.enqueued_at = now;
                EnqueueOutcome::Superseded
            }
            None => {
                inner.entries.insert(
                    key.clone(),
                    QueueEntry {
                        conversation_key: key.clone(),
                        aggregated_body: event.body.clone(),
                        message_ids: vec![event.message_id.clone()],
                        record_ids: vec![record_id],
                        first_event_at: event.observed_at,
                        enqueued_at: now,
                    },
                );
                inner.order.push_back(key);
                EnqueueOutcome::Queued
            }
        }
    }

    /// Pop the first entry whose conversation is not being dispatched.
    /// Skipped conversations keep their position, so a conversation
    /// blocked for a full sweep is retried on the next tick rather than
    /// starved.
    pub fn dequeue_next(&self, locks: &ConversationLocks) -> Option<QueueEntry> {
        let mut inner = self.inner();
        let position = inner
            .order
            .iter()
            .position(|key| inner.entries.contains_key(key) && !locks.is_locked(key))?;
        let key = inner.order.remove(position)?;
        inner.entries.remove(&key)
    }

    /// Return an entry whose lock acquisition lost a race; it goes to the
    /// queue tail. If a newer entry appeared for the conversation in the
    /// meantime, the bodies merge into that entry instead of duplicating
    /// the conversation's slot.
    pub fn requeue(&self, entry: QueueEntry) {
        let mut inner = self.inner();
        let key = entry.conversation_key.clone();
        match inner.entries.get_mut(&key) {
            Some(existing) => {
                let mut merged = entry;
                merged.aggregated_body.push('\n');
                merged.aggregated_body.push_str(&existing.aggregated_body);
                merged.message_ids.append(&mut existing.message_ids);
                merged.record_ids.append(&mut existing.record_ids);
                merged.enqueued_at = existing.enqueued_at;
                *existing = merged;
            }
            None => {
                inner.entries.insert(key.clone(), entry);
                inner.order.push_back(key);
            }
        }
    }

    pub fn size(&self) -> usize {
        self.inner().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{ConversationQueue, EnqueueOutcome};
    use crate::clock::{Clock, ManualClock};
    use crate::locks::ConversationLocks;
    use chrono::{Duration, TimeZone, Utc};
    use fl_gateway::{ConversationKey, InboundEvent};
    use std::sync::Arc;

    fn event(message_id: &str, key: &str, body: &str, clock: &dyn Clock) -> InboundEvent {
        InboundEvent {
            message_id: message_id.into(),
            conversation_key: key.into(),
            sender_display_name: None,
            body: body.to_string(),
            has_media: false,
            observed_at: clock.now(),
            gateway_timestamp: None,
            source_gateway_id: "gw".into(),
        }
    }

    fn fixtures() -> (Arc<ManualClock>, ConversationQueue, ConversationLocks) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
        let queue = ConversationQueue::new(clock.clone(), Duration::seconds(3));
        let locks = ConversationLocks::new(clock.clone(), Duration::seconds(45));
        (clock, queue, locks)
    }

    #[test]
    fn rapid_messages_merge_into_one_entry_in_arrival_order() {
        let (clock, queue, locks) = fixtures();
        let key = "15551234567";

        assert_eq!(
            queue.enqueue(&event("m1", key, "I need a flight", clock.as_ref()), "r1".into()),
            EnqueueOutcome::Queued
        );
        clock.advance(Duration::seconds(1));
        assert_eq!(
            queue.enqueue(&event("m2", key, "to Lisbon", clock.as_ref()), "r2".into()),
            EnqueueOutcome::Aggregated
        );
        clock.advance(Duration::seconds(1));
        assert_eq!(
            queue.enqueue(&event("m3", key, "next Friday", clock.as_ref()), "r3".into()),
            EnqueueOutcome::Aggregated
        );

        assert_eq!(queue.size(), 1);
        let entry = queue.dequeue_next(&locks).expect("entry should dequeue");
        assert_eq!(entry.aggregated_body, "I need a flight\nto Lisbon\nnext Friday");
        assert_eq!(entry.record_ids, vec!["r1", "r2", "r3"]);
        assert!(queue.dequeue_next(&locks).is_none());
    }

    #[test]
    fn stale_backlog_entry_is_superseded_not_duplicated() {
        let (clock, queue, locks) = fixtures();
        let key = "15551234567";

        queue.enqueue(&event("m1", key, "old question", clock.as_ref()), "r1".into());
        clock.advance(Duration::seconds(10));
        assert_eq!(
            queue.enqueue(&event("m2", key, "new question", clock.as_ref()), "r2".into()),
            EnqueueOutcome::Superseded
        );

        assert_eq!(queue.size(), 1);
        let entry = queue.dequeue_next(&locks).expect("entry should dequeue");
        assert_eq!(entry.aggregated_body, "new question");
        assert_eq!(entry.record_ids, vec!["r1", "r2"]);
    }

    #[test]
    fn dequeue_skips_locked_conversations_and_keeps_fifo_order() {
        let (clock, queue, locks) = fixtures();

        queue.enqueue(&event("m1", "1111", "first", clock.as_ref()), "r1".into());
        queue.enqueue(&event("m2", "2222", "second", clock.as_ref()), "r2".into());
        queue.enqueue(&event("m3", "3333", "third", clock.as_ref()), "r3".into());

        assert!(locks.try_acquire(&ConversationKey::from("1111")));
        let entry = queue.dequeue_next(&locks).expect("unlocked entry should dequeue");
        assert_eq!(entry.conversation_key.as_str(), "2222");

        locks.release(&ConversationKey::from("1111"));
        let entry = queue.dequeue_next(&locks).expect("entry should dequeue");
        assert_eq!(entry.conversation_key.as_str(), "1111");
        let entry = queue.dequeue_next(&locks).expect("entry should dequeue");
        assert_eq!(entry.conversation_key.as_str(), "3333");
    }

    #[test]
    fn requeued_entry_returns_to_tail_without_duplicating_slot() {
        let (clock, queue, locks) = fixtures();
        let key = "15551234567";

        queue.enqueue(&event("m1", key, "hello", clock.as_ref()), "r1".into());
        queue.enqueue(&event("m2", "2222", "other", clock.as_ref()), "r2".into());

        let entry = queue.dequeue_next(&locks).expect("entry should dequeue");
        assert_eq!(entry.conversation_key.as_str(), key);

        // A newer message lands while the dequeued entry waits on a lock.
        queue.enqueue(&event("m3", key, "are you there?", clock.as_ref()), "r3".into());
        queue.requeue(entry);

        assert_eq!(queue.size(), 2);
        let other = queue.dequeue_next(&locks).expect("entry should dequeue");
        assert_eq!(other.conversation_key.as_str(), "2222");
        let merged = queue.dequeue_next(&locks).expect("entry should dequeue");
        assert_eq!(merged.aggregated_body, "hello\nare you there?");
        assert_eq!(merged.record_ids, vec!["r1", "r3"]);
    }
}
