//! Messaging-gateway client for Fareline.
//!
//! The gateway is consumed through a narrow contract: fetch new messages,
//! send a text reply, acknowledge receipt. Everything else here is the
//! boundary transform from raw gateway envelopes to normalized
//! [`InboundEvent`]s.

mod http;
mod normalize;
mod traits;
mod types;

pub use http::HttpGateway;
pub use normalize::{normalize_conversation_key, normalize_envelope};
pub use traits::MessageGateway;
pub use types::{ConversationKey, GatewayEnvelope, GatewayId, InboundEvent, MessageId};
