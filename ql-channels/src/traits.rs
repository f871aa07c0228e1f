use crate::types::OutboundMessage;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "wazzup".
    fn channel_id(&self) -> &str;

    /// Send a message to a specific chat on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;
}
