//! Outbound reply throttle.
//!
//! Two independent checks, either of which suppresses a send: a cooldown
//! on any reply to the same conversation, and a longer window on
//! byte-identical reply content. Suppression is "already handled", not a
//! fault; callers drop the reply silently.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fl_gateway::ConversationKey;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    Cooldown,
    RepeatContent,
}

pub struct ResponseThrottle {
    clock: Arc<dyn Clock>,
    cooldown: chrono::Duration,
    repeat_window: chrono::Duration,
    last_reply: DashMap<ConversationKey, DateTime<Utc>>,
    recent_content: DashMap<String, ContentEntry>,
}

struct ContentEntry {
    conversation_key: String,
    last_sent_at: DateTime<Utc>,
}

impl ResponseThrottle {
    pub fn new(
        clock: Arc<dyn Clock>,
        cooldown: chrono::Duration,
        repeat_window: chrono::Duration,
    ) -> Self {
        Self {
            clock,
            cooldown,
            repeat_window,
            last_reply: DashMap::new(),
            recent_content: DashMap::new(),
        }
    }

    pub fn should_suppress(
        &self,
        key: &ConversationKey,
        reply_text: &str,
    ) -> Option<SuppressReason> {
        let now = self.clock.now();

        if let Some(last) = self.last_reply.get(key) {
            if now - *last < self.cooldown {
                return Some(SuppressReason::Cooldown);
            }
        }

        if let Some(entry) = self.recent_content.get(&content_key(key, reply_text)) {
            if now - entry.last_sent_at < self.repeat_window {
                return Some(SuppressReason::RepeatContent);
            }
        }

        None
    }

    pub fn record(&self, key: &ConversationKey, reply_text: &str) {
        let now = self.clock.now();
        self.last_reply.insert(key.clone(), now);
        self.recent_content.insert(
            content_key(key, reply_text),
            ContentEntry {
                conversation_key: key.to_string(),
                last_sent_at: now,
            },
        );
    }

    /// Drop expired throttle state, leaving conversations in `skip_keys`
    /// untouched so an in-flight dispatch never sees its state reset.
    pub fn sweep(&self, skip_keys: &[String]) -> usize {
        let now = self.clock.now();
        let before = self.last_reply.len() + self.recent_content.len();
        self.last_reply.retain(|key, last| {
            skip_keys.contains(&key.to_string()) || now - *last < self.cooldown
        });
        self.recent_content.retain(|_, entry| {
            skip_keys.contains(&entry.conversation_key)
                || now - entry.last_sent_at < self.repeat_window
        });
        before - (self.last_reply.len() + self.recent_content.len())
    }
}

fn content_key(key: &ConversationKey, reply_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update(b"\n");
    hasher.update(reply_text.as_bytes());
    format!("{:x}", hasher.finalize())
}
