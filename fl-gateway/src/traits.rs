use crate::types::{GatewayEnvelope, MessageId};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Stable identifier of the gateway instance: "chatwire", "fake".
    fn gateway_id(&self) -> &str;

    /// Fetch messages the gateway has not yet handed out, oldest first.
    async fn fetch_new_messages(&self, limit: usize) -> Result<Vec<GatewayEnvelope>>;

    /// Send a text reply to a conversation counterpart.
    async fn send_text(&self, to: &str, text: &str) -> Result<()>;

    /// Acknowledge receipt of messages in a chat. Gateways that redeliver
    /// unacknowledged messages rely on this being called promptly.
    async fn mark_read(&self, chat_id: &str, message_ids: &[MessageId]) -> Result<()>;
}
