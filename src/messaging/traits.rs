//! Transport trait the watch subsystem talks through.

use crate::error::Result;
use crate::{ChannelId, InboundMessage};

/// Read/write access to a chat platform, abstracted so the watch subsystem
/// and router never touch platform types directly.
#[async_trait::async_trait]
pub trait ChatTransport: Send + Sync {
    /// Fetch up to `limit` recent messages, oldest first.
    async fn recent_messages(&self, channel_id: &ChannelId, limit: u8)
    -> Result<Vec<InboundMessage>>;

    /// Send a message and return its platform ID.
    async fn send_message(&self, channel_id: &ChannelId, text: &str) -> Result<String>;

    /// Best-effort typing indicator. Default no-op for platforms without one.
    async fn start_typing(&self, _channel_id: &ChannelId) -> Result<()> {
        Ok(())
    }
}
