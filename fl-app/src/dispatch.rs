//! Dispatch orchestrator.
//!
//! Owns the control loop around each conversation turn: dequeue, lock,
//! consult the decision engine, send the reply through the throttle,
//! record the outcome, release. Also owns ingestion from the gateway
//! (poll and push converge here) and the error/fallback policy: a
//! customer gets the intended reply or one generic fallback, never a raw
//! error and never more than one reply per turn.

use crate::clock::Clock;
use crate::ledger::{Admission, DedupLedger, PROCESSED_MESSAGES, RejectReason};
use crate::locks::ConversationLocks;
use crate::queue::{ConversationQueue, QueueEntry};
use crate::session::{SessionPatch, SessionStore};
use crate::stats::PipelineStats;
use crate::throttle::{ResponseThrottle, SuppressReason};
use anyhow::Result;
use fl_decision::{DecisionContext, DecisionEngine, SideEffect, TurnRole};
use fl_gateway::{ConversationKey, GatewayEnvelope, MessageGateway, MessageId, normalize_envelope};
use fl_store::{Filter, SortOrder, Store};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const CUSTOMERS: &str = "customers";
pub const REVIEW_FLAGS: &str = "review_flags";

const RETRY_BASE_MS: u64 = 250;
const RETRY_MAX_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct DispatchTuning {
    pub poll_interval: Duration,
    pub fetch_limit: usize,
    pub start_from_latest: bool,
    /// Fixed pause between receiving a decision and sending the reply, a
    /// damper against two dispatch paths racing to reply at once.
    pub send_delay: Duration,
    pub drain_interval: Duration,
    pub fallback_reply: String,
    pub notify_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_key: Option<ConversationKey>,
}

impl IngestReceipt {
    fn discarded() -> Self {
        Self {
            accepted: false,
            reason: None,
            message_id: None,
            conversation_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Replied,
    Suppressed(SuppressReason),
    Failed,
    Contended,
}

pub struct Dispatcher {
    tuning: DispatchTuning,
    clock: Arc<dyn Clock>,
    gateway: Arc<dyn MessageGateway>,
    engine: Arc<dyn DecisionEngine>,
    store: Arc<dyn Store>,
    ledger: Arc<DedupLedger>,
    queue: Arc<ConversationQueue>,
    locks: Arc<ConversationLocks>,
    sessions: Arc<SessionStore>,
    throttle: Arc<ResponseThrottle>,
    stats: Arc<PipelineStats>,
    http: reqwest::Client,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tuning: DispatchTuning,
        clock: Arc<dyn Clock>,
        gateway: Arc<dyn MessageGateway>,
        engine: Arc<dyn DecisionEngine>,
        store: Arc<dyn Store>,
        ledger: Arc<DedupLedger>,
        queue: Arc<ConversationQueue>,
        locks: Arc<ConversationLocks>,
        sessions: Arc<SessionStore>,
        throttle: Arc<ResponseThrottle>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            tuning,
            clock,
            gateway,
            engine,
            store,
            ledger,
            queue,
            locks,
            sessions,
            throttle,
            stats,
            http: reqwest::Client::new(),
        }
    }

    /// Poll and push ingestion converge here: normalize, acknowledge,
    /// admit, enqueue.
    #[tracing::instrument(level = "info", skip_all, fields(gateway_id = %gateway_id))]
    pub async fn ingest_envelope(
        &self,
        gateway_id: &str,
        envelope: &GatewayEnvelope,
    ) -> IngestReceipt {
        let Some(event) = normalize_envelope(gateway_id, envelope) else {
            PipelineStats::bump(&self.stats.discarded);
            tracing::debug!("envelope dropped at adapter boundary");
            return IngestReceipt::discarded();
        };

        // Acknowledge before any downstream work: an unacknowledged
        // message is redelivered on every poll cycle.
        if let Some(chat_id) = envelope.ack_chat_id() {
            if let Err(error) = self
                .gateway
                .mark_read(chat_id, std::slice::from_ref(&event.message_id))
                .await
            {
                tracing::warn!(
                    %error,
                    conversation_key = %event.conversation_key,
                    "gateway mark-read failed"
                );
            }
        }

        match self.ledger.admit(&event).await {
            Ok(Admission::Accepted { record_id }) => {
                let outcome = self.queue.enqueue(&event, record_id);
                PipelineStats::bump(&self.stats.admitted);
                tracing::info!(
                    conversation_key = %event.conversation_key,
                    message_id = %event.message_id,
                    enqueue_outcome = ?outcome,
                    queue_depth = self.queue.size(),
                    "event admitted"
                );
                IngestReceipt {
                    accepted: true,
                    reason: None,
                    message_id: Some(event.message_id),
                    conversation_key: Some(event.conversation_key),
                }
            }
            Ok(Admission::Rejected(reason)) => {
                PipelineStats::bump(&self.stats.rejected_duplicate);
                tracing::debug!(
                    conversation_key = %event.conversation_key,
                    message_id = %event.message_id,
                    reason = ?reason,
                    "event rejected as duplicate"
                );
                IngestReceipt {
                    accepted: false,
                    reason: Some(reason),
                    message_id: Some(event.message_id),
                    conversation_key: Some(event.conversation_key),
                }
            }
            Err(error) => {
                PipelineStats::bump(&self.stats.discarded);
                tracing::warn!(
                    %error,
                    message_id = %event.message_id,
                    "ledger admission failed; dropping event"
                );
                IngestReceipt::discarded()
            }
        }
    }

    /// One dequeue-lock-dispatch-release cycle. `None` when nothing is
    /// eligible (empty queue, or every queued conversation is locked).
    pub async fn process_next(&self) -> Option<DispatchOutcome> {
        let entry = self.queue.dequeue_next(&self.locks)?;
        let key = entry.conversation_key.clone();
        if !self.locks.try_acquire(&key) {
            self.queue.requeue(entry);
            return Some(DispatchOutcome::Contended);
        }

        let outcome = self.dispatch_entry(&entry).await;
        // The lock is freed on every path, success or failure.
        self.locks.release(&key);

        match outcome {
            DispatchOutcome::Replied => PipelineStats::bump(&self.stats.replied),
            DispatchOutcome::Suppressed(_) => PipelineStats::bump(&self.stats.suppressed),
            DispatchOutcome::Failed => PipelineStats::bump(&self.stats.failed),
            DispatchOutcome::Contended => {}
        }
        Some(outcome)
    }

    #[tracing::instrument(level = "info", skip_all, fields(conversation_key = %entry.conversation_key))]
    async fn dispatch_entry(&self, entry: &QueueEntry) -> DispatchOutcome {
        match self.try_respond(entry).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(%error, "dispatch failed; attempting fallback reply");
                self.send_fallback(&entry.conversation_key).await;
                // The originating events count as processed either way, so
                // no retry path picks them up again.
                self.resolve_records(&entry.record_ids, "failed").await;
                DispatchOutcome::Failed
            }
        }
    }

    async fn try_respond(&self, entry: &QueueEntry) -> Result<DispatchOutcome> {
        let key = &entry.conversation_key;
        let session = self.sessions.get_or_create(key).await?;
        let context = DecisionContext {
            history: session.recent_turns.clone(),
            session_state: session.state_json(),
            customer_profile: self.load_customer_profile(key).await,
        };

        tracing::debug!(
            messages = entry.message_ids.len(),
            history_turns = context.history.len(),
            "dispatching aggregated turn to decision engine"
        );
        let decision = self.engine.decide(&context, &entry.aggregated_body).await?;

        if !self.tuning.send_delay.is_zero() {
            tokio::time::sleep(self.tuning.send_delay).await;
        }

        if let Some(reason) = self.throttle.should_suppress(key, &decision.reply_text) {
            tracing::info!(reason = ?reason, "reply suppressed by throttle");
            self.sessions
                .append_turn(key, TurnRole::Customer, &entry.aggregated_body)
                .await?;
            self.resolve_records(&entry.record_ids, "suppressed").await;
            return Ok(DispatchOutcome::Suppressed(reason));
        }

        self.gateway
            .send_text(key.as_str(), &decision.reply_text)
            .await?;
        self.throttle.record(key, &decision.reply_text);

        self.sessions
            .append_turn(key, TurnRole::Customer, &entry.aggregated_body)
            .await?;
        self.sessions
            .append_turn(key, TurnRole::Assistant, &decision.reply_text)
            .await?;
        self.sessions.touch(
            key,
            SessionPatch {
                last_intent: decision.intent.clone(),
                ..SessionPatch::default()
            },
        );

        self.run_side_effects(key, &decision.side_effects).await;
        self.resolve_records(&entry.record_ids, "replied").await;
        Ok(DispatchOutcome::Replied)
    }

    /// Best-effort apology, itself throttle-checked so a flapping engine
    /// cannot spam a customer.
    async fn send_fallback(&self, key: &ConversationKey) {
        let fallback = self.tuning.fallback_reply.as_str();
        if let Some(reason) = self.throttle.should_suppress(key, fallback) {
            tracing::info!(reason = ?reason, conversation_key = %key, "fallback suppressed");
            return;
        }
        match self.gateway.send_text(key.as_str(), fallback).await {
            Ok(()) => {
                self.throttle.record(key, fallback);
                PipelineStats::bump(&self.stats.fallbacks_sent);
            }
            Err(error) => {
                tracing::warn!(%error, conversation_key = %key, "fallback send failed");
            }
        }
    }

    async fn resolve_records(&self, record_ids: &[String], status: &str) {
        let resolved_at = self.clock.now();
        for record_id in record_ids {
            if let Err(error) = self
                .store
                .update(
                    PROCESSED_MESSAGES,
                    record_id,
                    serde_json::json!({ "status": status, "resolved_at": resolved_at }),
                )
                .await
            {
                tracing::warn!(%error, record_id = %record_id, "failed to resolve processed-message record");
            }
        }
    }

    async fn load_customer_profile(&self, key: &ConversationKey) -> Option<serde_json::Value> {
        match self
            .store
            .filter(
                CUSTOMERS,
                &[Filter::eq("conversation_key", key.as_str())],
                SortOrder::NewestFirst,
                1,
            )
            .await
        {
            Ok(records) => records.into_iter().next().map(|record| record.data),
            Err(error) => {
                tracing::warn!(%error, conversation_key = %key, "customer profile lookup failed");
                None
            }
        }
    }

    /// Side effects never fail a dispatch; failures are logged and the
    /// turn still counts as replied.
    async fn run_side_effects(&self, key: &ConversationKey, effects: &[SideEffect]) {
        for effect in effects {
            match effect {
                SideEffect::Notify { target, note } => {
                    let Some(url) = self.tuning.notify_url.as_deref() else {
                        tracing::warn!(
                            notify_target = %target,
                            "notify side effect but no notify_url configured"
                        );
                        continue;
                    };
                    let payload = serde_json::json!({
                        "target": target,
                        "note": note,
                        "conversation_key": key.as_str(),
                    });
                    match self.http.post(url).json(&payload).send().await {
                        Ok(response) if !response.status().is_success() => {
                            tracing::warn!(
                                status = response.status().as_u16(),
                                "notify side effect rejected"
                            );
                        }
                        Ok(_) => {}
                        Err(error) => tracing::warn!(%error, "notify side effect failed"),
                    }
                }
                SideEffect::Escalate { reason } => {
                    self.sessions.touch(
                        key,
                        SessionPatch {
                            escalate: true,
                            ..SessionPatch::default()
                        },
                    );
                    tracing::info!(reason = %reason, conversation_key = %key, "conversation escalated");
                }
                SideEffect::FlagForReview { reason } => {
                    let flag = serde_json::json!({
                        "conversation_key": key.as_str(),
                        "reason": reason,
                        "flagged_at": self.clock.now(),
                    });
                    if let Err(error) = self.store.create(REVIEW_FLAGS, flag).await {
                        tracing::warn!(%error, "review flag write failed");
                    }
                }
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_ingest_loop(&self, shutdown: CancellationToken) {
        let gateway_id = self.gateway.gateway_id().to_string();
        let mut cursor_ms: Option<i64> = None;
        let mut consecutive_failures: u32 = 0;

        if self.tuning.start_from_latest {
            match self.gateway.fetch_new_messages(self.tuning.fetch_limit).await {
                Ok(envelopes) => {
                    cursor_ms = envelopes.iter().filter_map(|e| e.timestamp_ms).max();
                    tracing::info!(cursor_ms = ?cursor_ms, "ingest cursor seeded");
                }
                Err(error) => {
                    tracing::warn!(%error, "ingest cursor seed failed; starting unseeded");
                }
            }
        }

        loop {
            let delay = if consecutive_failures == 0 {
                self.tuning.poll_interval
            } else {
                transient_retry_delay(consecutive_failures)
            };
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("ingest loop stopping");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            PipelineStats::bump(&self.stats.poll_cycles);
            let envelopes = match self.gateway.fetch_new_messages(self.tuning.fetch_limit).await {
                Ok(envelopes) => {
                    consecutive_failures = 0;
                    envelopes
                }
                Err(error) => {
                    consecutive_failures += 1;
                    PipelineStats::bump(&self.stats.poll_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        "gateway fetch failed; retrying with backoff"
                    );
                    continue;
                }
            };

            let mut admitted = 0usize;
            let mut newest = cursor_ms;
            for envelope in &envelopes {
                if let Some(ts) = envelope.timestamp_ms {
                    if cursor_ms.is_some_and(|cursor| ts <= cursor) {
                        continue;
                    }
                    match newest {
                        Some(current) if current >= ts => {}
                        _ => newest = Some(ts),
                    }
                }
                let receipt = self.ingest_envelope(&gateway_id, envelope).await;
                if receipt.accepted {
                    admitted += 1;
                }
            }
            cursor_ms = newest;
            tracing::debug!(admitted, cursor_ms = ?cursor_ms, "poll cycle complete");
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run_drain_loop(&self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("drain loop stopping");
                    return;
                }
                _ = tokio::time::sleep(self.tuning.drain_interval) => {}
            }

            while let Some(outcome) = self.process_next().await {
                if outcome == DispatchOutcome::Contended {
                    break;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((RETRY_BASE_MS * multiplier).min(RETRY_MAX_MS))
}

#[cfg(test)]
mod tests {
    use super::{DispatchOutcome, DispatchTuning, Dispatcher, transient_retry_delay};
    use crate::clock::ManualClock;
    use crate::ledger::{DedupLedger, PROCESSED_MESSAGES, RejectReason};
    use crate::locks::ConversationLocks;
    use crate::queue::ConversationQueue;
    use crate::session::SessionStore;
    use crate::stats::PipelineStats;
    use crate::throttle::{ResponseThrottle, SuppressReason};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use fl_decision::{Decision, DecisionContext, DecisionEngine, SideEffect};
    use fl_gateway::{ConversationKey, GatewayEnvelope, MessageGateway, MessageId};
    use fl_store::{Filter, MemoryStore, SortOrder, Store};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct FakeGateway {
        sent: Mutex<Vec<(String, String)>>,
        marked_read: Mutex<Vec<String>>,
        fail_sends: AtomicBool,
    }

    impl FakeGateway {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                marked_read: Mutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
            }
        }

        fn sent(&self) -> Vec<(String, String)> {
            self.sent.lock().expect("sent lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl MessageGateway for FakeGateway {
        fn gateway_id(&self) -> &str {
            "fake"
        }

        async fn fetch_new_messages(&self, _limit: usize) -> anyhow::Result<Vec<GatewayEnvelope>> {
            Ok(Vec::new())
        }

        async fn send_text(&self, to: &str, text: &str) -> anyhow::Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                anyhow::bail!("gateway send unavailable");
            }
            self.sent
                .lock()
                .expect("sent lock")
                .push((to.to_string(), text.to_string()));
            Ok(())
        }

        async fn mark_read(&self, chat_id: &str, _message_ids: &[MessageId]) -> anyhow::Result<()> {
            self.marked_read
                .lock()
                .expect("marked_read lock")
                .push(chat_id.to_string());
            Ok(())
        }
    }

    struct ScriptedEngine {
        script: Mutex<VecDeque<fl_decision::Result<Decision>>>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<fl_decision::Result<Decision>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl DecisionEngine for ScriptedEngine {
        async fn decide(
            &self,
            _context: &DecisionContext,
            _message: &str,
        ) -> fl_decision::Result<Decision> {
            self.script
                .lock()
                .expect("script lock")
                .pop_front()
                .unwrap_or_else(|| Ok(reply("ok")))
        }
    }

    fn reply(text: &str) -> Decision {
        Decision {
            intent: Some("flight_search".to_string()),
            reply_text: text.to_string(),
            side_effects: vec![],
            confidence: 0.9,
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        gateway: Arc<FakeGateway>,
        store: Arc<MemoryStore>,
        sessions: Arc<SessionStore>,
        locks: Arc<ConversationLocks>,
        queue: Arc<ConversationQueue>,
        stats: Arc<PipelineStats>,
        dispatcher: Dispatcher,
    }

    fn harness(script: Vec<fl_decision::Result<Decision>>) -> Harness {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
        let gateway = Arc::new(FakeGateway::new());
        let store = Arc::new(MemoryStore::new());
        let store_dyn: Arc<dyn Store> = store.clone();
        let ledger = Arc::new(DedupLedger::new(
            clock.clone(),
            store_dyn.clone(),
            ChronoDuration::seconds(90),
            ChronoDuration::seconds(30),
        ));
        let queue = Arc::new(ConversationQueue::new(
            clock.clone(),
            ChronoDuration::seconds(3),
        ));
        let locks = Arc::new(ConversationLocks::new(
            clock.clone(),
            ChronoDuration::seconds(45),
        ));
        let sessions = Arc::new(SessionStore::new(
            clock.clone(),
            store_dyn.clone(),
            ChronoDuration::seconds(3600),
            30,
        ));
        let throttle = Arc::new(ResponseThrottle::new(
            clock.clone(),
            ChronoDuration::seconds(4),
            ChronoDuration::seconds(30),
        ));
        let stats = Arc::new(PipelineStats::default());
        let tuning = DispatchTuning {
            poll_interval: Duration::from_millis(10),
            fetch_limit: 10,
            start_from_latest: false,
            send_delay: Duration::ZERO,
            drain_interval: Duration::from_millis(10),
            fallback_reply: "Sorry, something went wrong on our side.".to_string(),
            notify_url: None,
        };
        let dispatcher = Dispatcher::new(
            tuning,
            clock.clone(),
            gateway.clone(),
            Arc::new(ScriptedEngine::new(script)),
            store_dyn,
            ledger,
            queue.clone(),
            locks.clone(),
            sessions.clone(),
            throttle,
            stats.clone(),
        );
        Harness {
            clock,
            gateway,
            store,
            sessions,
            locks,
            queue,
            stats,
            dispatcher,
        }
    }

    fn envelope(id: &str, from: &str, body: &str) -> GatewayEnvelope {
        GatewayEnvelope {
            id: Some(id.to_string()),
            from: Some(from.to_string()),
            body: Some(body.to_string()),
            ..GatewayEnvelope::default()
        }
    }

    #[tokio::test]
    async fn admitted_event_produces_exactly_one_reply() {
        let h = harness(vec![Ok(reply("hi!"))]);

        let receipt = h
            .dispatcher
            .ingest_envelope("fake", &envelope("m1", "1555", "hello"))
            .await;
        assert!(receipt.accepted);

        let outcome = h.dispatcher.process_next().await;
        assert_eq!(outcome, Some(DispatchOutcome::Replied));
        assert_eq!(h.gateway.sent(), vec![("1555".to_string(), "hi!".to_string())]);
        assert!(h.dispatcher.process_next().await.is_none());
    }

    #[tokio::test]
    async fn duplicate_delivery_is_rejected_and_replied_once() {
        let h = harness(vec![Ok(reply("hi!"))]);
        let envelope = envelope("m1", "1555", "hello");

        let first = h.dispatcher.ingest_envelope("fake", &envelope).await;
        assert!(first.accepted);
        let second = h.dispatcher.ingest_envelope("fake", &envelope).await;
        assert!(!second.accepted);
        assert_eq!(second.reason, Some(RejectReason::DuplicateIdentifier));

        // Both deliveries are acknowledged to the gateway regardless.
        assert_eq!(h.gateway.marked_read.lock().expect("lock").len(), 2);

        while h.dispatcher.process_next().await.is_some() {}
        assert_eq!(h.gateway.sent().len(), 1);
    }

    #[tokio::test]
    async fn engine_failure_sends_one_fallback_and_marks_processed() {
        let h = harness(vec![Err(fl_decision::DecisionError::Http(
            "engine 500".to_string(),
        ))]);

        h.dispatcher
            .ingest_envelope("fake", &envelope("m1", "1555", "hello"))
            .await;
        let outcome = h.dispatcher.process_next().await;
        assert_eq!(outcome, Some(DispatchOutcome::Failed));

        let sent = h.gateway.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Sorry, something went wrong on our side.");

        let records = h
            .store
            .filter(
                PROCESSED_MESSAGES,
                &[Filter::eq("message_id", "m1")],
                SortOrder::OldestFirst,
                10,
            )
            .await
            .expect("filter should succeed");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data["status"], "failed");

        // Processed means processed: nothing left to retry.
        assert!(h.dispatcher.process_next().await.is_none());
        assert_eq!(h.stats.snapshot().fallbacks_sent, 1);
    }

    #[tokio::test]
    async fn identical_reply_within_window_is_suppressed() {
        let h = harness(vec![Ok(reply("hi!")), Ok(reply("hi!"))]);

        h.dispatcher
            .ingest_envelope("fake", &envelope("m1", "1555", "hello"))
            .await;
        assert_eq!(
            h.dispatcher.process_next().await,
            Some(DispatchOutcome::Replied)
        );

        // Past the cooldown but inside the repeat-content window.
        h.clock.advance(ChronoDuration::seconds(5));
        h.dispatcher
            .ingest_envelope("fake", &envelope("m2", "1555", "are you there?"))
            .await;
        assert_eq!(
            h.dispatcher.process_next().await,
            Some(DispatchOutcome::Suppressed(SuppressReason::RepeatContent))
        );
        assert_eq!(h.gateway.sent().len(), 1);
    }

    #[tokio::test]
    async fn reply_inside_cooldown_is_suppressed() {
        let h = harness(vec![Ok(reply("hi!")), Ok(reply("different reply"))]);

        h.dispatcher
            .ingest_envelope("fake", &envelope("m1", "1555", "hello"))
            .await;
        assert_eq!(
            h.dispatcher.process_next().await,
            Some(DispatchOutcome::Replied)
        );

        h.clock.advance(ChronoDuration::seconds(1));
        h.dispatcher
            .ingest_envelope("fake", &envelope("m2", "1555", "second message"))
            .await;
        assert_eq!(
            h.dispatcher.process_next().await,
            Some(DispatchOutcome::Suppressed(SuppressReason::Cooldown))
        );
        assert_eq!(h.gateway.sent().len(), 1);
    }

    #[tokio::test]
    async fn locked_conversation_is_not_dispatched_until_release() {
        let h = harness(vec![Ok(reply("hi!"))]);
        let key = ConversationKey::from("1555");

        h.dispatcher
            .ingest_envelope("fake", &envelope("m1", "1555", "hello"))
            .await;

        assert!(h.locks.try_acquire(&key));
        assert!(h.dispatcher.process_next().await.is_none());
        assert_eq!(h.queue.size(), 1);

        h.locks.release(&key);
        assert_eq!(
            h.dispatcher.process_next().await,
            Some(DispatchOutcome::Replied)
        );
    }

    #[tokio::test]
    async fn repeated_engine_failures_do_not_spam_fallbacks() {
        let h = harness(vec![
            Err(fl_decision::DecisionError::Http("engine 500".to_string())),
            Err(fl_decision::DecisionError::Http("engine 500".to_string())),
        ]);

        h.dispatcher
            .ingest_envelope("fake", &envelope("m1", "1555", "hello"))
            .await;
        h.dispatcher.process_next().await;

        h.clock.advance(ChronoDuration::seconds(5));
        h.dispatcher
            .ingest_envelope("fake", &envelope("m2", "1555", "still there?"))
            .await;
        h.dispatcher.process_next().await;

        // Second fallback is byte-identical within the repeat window.
        assert_eq!(h.gateway.sent().len(), 1);
        assert_eq!(h.stats.snapshot().fallbacks_sent, 1);
    }

    #[tokio::test]
    async fn side_effects_escalate_and_flag() {
        let decision = Decision {
            intent: Some("complaint".to_string()),
            reply_text: "A supervisor will contact you.".to_string(),
            side_effects: vec![
                SideEffect::Escalate {
                    reason: "repeat complaint".to_string(),
                },
                SideEffect::FlagForReview {
                    reason: "possible refund".to_string(),
                },
            ],
            confidence: 0.8,
        };
        let h = harness(vec![Ok(decision)]);

        h.dispatcher
            .ingest_envelope("fake", &envelope("m1", "1555", "this is unacceptable"))
            .await;
        assert_eq!(
            h.dispatcher.process_next().await,
            Some(DispatchOutcome::Replied)
        );

        let flags = h
            .store
            .filter(super::REVIEW_FLAGS, &[], SortOrder::OldestFirst, 10)
            .await
            .expect("filter should succeed");
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].data["reason"], "possible refund");

        let summaries = h.sessions.list();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].escalation_level, 1);
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }
}
