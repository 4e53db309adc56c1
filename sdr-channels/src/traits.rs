use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier, e.g. "evolution".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    /// Webhook-driven adapters return immediately.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a text message to a normalized phone number.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
