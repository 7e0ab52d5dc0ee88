//! Per-conversation session state.
//!
//! Short-term state (last intent, pending search, escalation level) lives
//! in memory and rotates after an idle timeout; the long-form turn
//! history is persisted through the durable store and preloaded, bounded,
//! when a session is created.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fl_decision::{Turn, TurnRole};
use fl_gateway::ConversationKey;
use fl_store::{Filter, SortOrder, Store};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

pub const CONVERSATION_TURNS: &str = "conversation_turns";

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub last_intent: Option<String>,
    pub pending_search: Option<serde_json::Value>,
    pub escalation_level: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Bounded recent window; the durable store holds the full history.
    pub recent_turns: Vec<Turn>,
}

impl Session {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            last_intent: None,
            pending_search: None,
            escalation_level: 0,
            created_at: now,
            last_activity_at: now,
            recent_turns: Vec::new(),
        }
    }

    pub fn state_json(&self) -> serde_json::Value {
        serde_json::json!({
            "last_intent": self.last_intent,
            "pending_search": self.pending_search,
            "escalation_level": self.escalation_level,
        })
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionPatch {
    pub last_intent: Option<String>,
    pub pending_search: Option<serde_json::Value>,
    pub escalate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub conversation_key: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub turns: usize,
    pub last_intent: Option<String>,
    pub escalation_level: u32,
}

pub struct SessionStore {
    clock: Arc<dyn Clock>,
    store: Arc<dyn Store>,
    session_timeout: chrono::Duration,
    history_limit: usize,
    sessions: DashMap<ConversationKey, Session>,
}

impl SessionStore {
    pub fn new(
        clock: Arc<dyn Clock>,
        store: Arc<dyn Store>,
        session_timeout: chrono::Duration,
        history_limit: usize,
    ) -> Self {
        Self {
            clock,
            store,
            session_timeout,
            history_limit,
            sessions: DashMap::new(),
        }
    }

    /// Current session for the conversation, creating or rotating as
    /// needed. A session idle past the timeout is superseded by a fresh
    /// one, not merged; the fresh session still preloads the recent
    /// durable history so engine context survives rotation and restarts.
    pub async fn get_or_create(&self, key: &ConversationKey) -> anyhow::Result<Session> {
        let now = self.clock.now();

        if let Some(existing) = self.sessions.get(key) {
            if now - existing.last_activity_at <= self.session_timeout {
                return Ok(existing.clone());
            }
            drop(existing);
            tracing::info!(conversation_key = %key, "rotating idle session");
        }

        let mut fresh = Session::new(now);
        fresh.recent_turns = self.load_recent_turns(key).await?;
        self.sessions.insert(key.clone(), fresh.clone());
        Ok(fresh)
    }

    pub fn touch(&self, key: &ConversationKey, patch: SessionPatch) {
        let now = self.clock.now();
        let mut session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(now));
        if let Some(intent) = patch.last_intent {
            session.last_intent = Some(intent);
        }
        if let Some(pending_search) = patch.pending_search {
            session.pending_search = Some(pending_search);
        }
        if patch.escalate {
            session.escalation_level += 1;
        }
        session.last_activity_at = now;
    }

    /// Record one turn: durable append plus the in-memory window, trimmed
    /// on every append so engine context stays bounded.
    pub async fn append_turn(
        &self,
        key: &ConversationKey,
        role: TurnRole,
        content: &str,
    ) -> anyhow::Result<()> {
        self.store
            .create(
                CONVERSATION_TURNS,
                serde_json::json!({
                    "conversation_key": key.as_str(),
                    "role": role,
                    "content": content,
                }),
            )
            .await?;

        let now = self.clock.now();
        let mut session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(now));
        session.recent_turns.push(Turn {
            role,
            content: content.to_string(),
        });
        let overflow = session.recent_turns.len().saturating_sub(self.history_limit);
        if overflow > 0 {
            session.recent_turns.drain(..overflow);
        }
        session.last_activity_at = now;
        Ok(())
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut out: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| {
                let (key, session) = entry.pair();
                SessionSummary {
                    id: session.id,
                    conversation_key: key.to_string(),
                    created_at: session.created_at,
                    last_activity_at: session.last_activity_at,
                    turns: session.recent_turns.len(),
                    last_intent: session.last_intent.clone(),
                    escalation_level: session.escalation_level,
                }
            })
            .collect();
        out.sort_by_key(|summary| summary.last_activity_at);
        out.reverse();
        out
    }

    /// Evict in-memory sessions idle past the timeout, except those named
    /// in `skip_keys`. Durable history is untouched.
    pub fn sweep_idle(&self, skip_keys: &[String]) -> usize {
        let now = self.clock.now();
        let before = self.sessions.len();
        self.sessions.retain(|key, session| {
            skip_keys.contains(&key.to_string())
                || now - session.last_activity_at <= self.session_timeout
        });
        before - self.sessions.len()
    }

    async fn load_recent_turns(&self, key: &ConversationKey) -> anyhow::Result<Vec<Turn>> {
        let records = self
            .store
            .filter(
                CONVERSATION_TURNS,
                &[Filter::eq("conversation_key", key.as_str())],
                SortOrder::NewestFirst,
                self.history_limit,
            )
            .await?;
        let mut turns: Vec<Turn> = records
            .into_iter()
            .filter_map(|record| serde_json::from_value(record.data).ok())
            .collect();
        turns.reverse();
        Ok(turns)
    }
}
