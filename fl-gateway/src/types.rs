use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                self.as_str()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &Self::Target {
                self.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

id_newtype!(MessageId);
id_newtype!(ConversationKey);
id_newtype!(GatewayId);

/// One observed customer message, normalized from a raw gateway envelope.
///
/// Created at ingestion and never mutated afterwards; the pipeline either
/// admits it into the conversation queue or discards it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub message_id: MessageId,
    pub conversation_key: ConversationKey,
    pub sender_display_name: Option<String>,
    pub body: String,
    pub has_media: bool,
    pub observed_at: DateTime<Utc>,
    pub gateway_timestamp: Option<DateTime<Utc>>,
    pub source_gateway_id: GatewayId,
}

/// Raw message shape returned by the gateway's fetch contract.
///
/// Every field is optional: gateways under-report fields routinely, and
/// normalization decides what is usable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayEnvelope {
    pub id: Option<String>,
    pub from: Option<String>,
    pub body: Option<String>,
    pub has_media: Option<bool>,
    pub from_me: Option<bool>,
    /// Source-reported send time, epoch milliseconds.
    pub timestamp_ms: Option<i64>,
    pub notify_name: Option<String>,
    pub chat_id: Option<String>,
}

impl GatewayEnvelope {
    /// Chat identifier to acknowledge against; direct chats report the
    /// sender address as the chat.
    pub fn ack_chat_id(&self) -> Option<&str> {
        self.chat_id
            .as_deref()
            .or(self.from.as_deref())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}
