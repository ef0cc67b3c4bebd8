//! Vigil: a Discord community bot that keeps conversations alive by watching
//! channels for follow-up activity and deciding, through an LLM pipeline,
//! whether and how to respond.

pub mod config;
pub mod debounce;
pub mod error;
pub mod llm;
pub mod messaging;
pub mod pipeline;
pub mod router;
pub mod watch;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Channel identifier type.
pub type ChannelId = Arc<str>;

/// Guild (community) identifier type.
pub type GuildId = Arc<str>;

/// Watcher identifier type.
pub type WatcherId = uuid::Uuid;

/// Inbound message from the chat transport.
///
/// Platform markup is already stripped by the adapter; the core only ever
/// sees these plain fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the message mentions the bot directly.
    pub is_mention: bool,
}

/// The bot's own identity, used to recognize self-authored messages and to
/// tell the collaborators who "me" is.
#[derive(Debug, Clone)]
pub struct BotIdentity {
    pub bot_id: String,
    pub bot_name: String,
}

/// Shared dependency bundle for the watch subsystem.
///
/// Constructed once at startup and handed by value to whichever task tree
/// needs it. There are no module-level singletons; everything a watch loop
/// touches arrives through this bundle.
#[derive(Clone)]
pub struct WatchDeps {
    pub manager: Arc<watch::WatchManager>,
    pub pipeline: Arc<dyn pipeline::WatchPipeline>,
    pub transport: Arc<dyn messaging::ChatTransport>,
    pub identity: BotIdentity,
    pub config: config::WatchConfig,
}

impl std::fmt::Debug for WatchDeps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchDeps")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}
