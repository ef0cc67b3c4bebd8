//! Discord transport and gateway wiring.
//!
//! All Discord specifics live here; the rest of the crate only sees
//! [`ChatTransport`] and [`InboundMessage`].

use crate::error::TransportError;
use crate::messaging::ChatTransport;
use crate::router::MessageRouter;
use crate::{BotIdentity, ChannelId, InboundMessage, Result};
use chrono::Utc;
use serenity::all::{Client, Context, EventHandler, GatewayIntents, GetMessages, Message, Ready};
use serenity::http::Http;
use std::sync::Arc;

fn parse_channel_id(channel_id: &ChannelId) -> Result<serenity::model::id::ChannelId> {
    let raw: u64 = channel_id
        .parse()
        .map_err(|_| TransportError::InvalidChannelId(channel_id.to_string()))?;
    if raw == 0 {
        return Err(TransportError::InvalidChannelId(channel_id.to_string()).into());
    }
    Ok(serenity::model::id::ChannelId::new(raw))
}

/// Map a gateway message into the transport-neutral shape.
pub fn convert_message(msg: &Message, bot_id: &str) -> InboundMessage {
    let is_mention = msg
        .mentions
        .iter()
        .any(|user| user.id.to_string() == bot_id);

    InboundMessage {
        id: msg.id.to_string(),
        author_id: msg.author.id.to_string(),
        author_name: msg
            .author
            .global_name
            .clone()
            .unwrap_or_else(|| msg.author.name.clone()),
        content: msg.content.clone(),
        timestamp: msg.timestamp.with_timezone(&Utc),
        is_mention,
    }
}

/// Look up who we are, once, at startup.
pub async fn fetch_identity(http: &Http) -> Result<BotIdentity> {
    let user = http
        .get_current_user()
        .await
        .map_err(TransportError::Discord)?;
    Ok(BotIdentity {
        bot_id: user.id.to_string(),
        bot_name: user.name.clone(),
    })
}

pub struct DiscordTransport {
    http: Arc<Http>,
    identity: BotIdentity,
}

impl DiscordTransport {
    pub fn new(http: Arc<Http>, identity: BotIdentity) -> Self {
        Self { http, identity }
    }
}

#[async_trait::async_trait]
impl ChatTransport for DiscordTransport {
    async fn recent_messages(
        &self,
        channel_id: &ChannelId,
        limit: u8,
    ) -> Result<Vec<InboundMessage>> {
        let channel = parse_channel_id(channel_id)?;
        let mut messages = channel
            .messages(&self.http, GetMessages::new().limit(limit))
            .await
            .map_err(TransportError::Discord)?;
        // Discord returns newest first; callers want chronological order.
        messages.reverse();
        Ok(messages
            .iter()
            .map(|msg| convert_message(msg, &self.identity.bot_id))
            .collect())
    }

    async fn send_message(&self, channel_id: &ChannelId, text: &str) -> Result<String> {
        let channel = parse_channel_id(channel_id)?;
        let sent = channel
            .say(&self.http, text)
            .await
            .map_err(TransportError::Discord)?;
        Ok(sent.id.to_string())
    }

    async fn start_typing(&self, channel_id: &ChannelId) -> Result<()> {
        let channel = parse_channel_id(channel_id)?;
        self.http
            .broadcast_typing(channel)
            .await
            .map_err(TransportError::Discord)?;
        Ok(())
    }
}

impl std::fmt::Debug for DiscordTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordTransport")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

struct GatewayHandler {
    router: Arc<MessageRouter>,
}

#[serenity::async_trait]
impl EventHandler for GatewayHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, "connected to Discord gateway");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }

        let channel_id: ChannelId = msg.channel_id.to_string().into();
        let guild_id = msg.guild_id.map(|id| crate::GuildId::from(id.to_string()));
        let inbound = convert_message(&msg, &self.router.identity().bot_id);

        let router = self.router.clone();
        // Routing can block on HTTP; never stall the gateway event loop.
        tokio::spawn(async move {
            router.dispatch(channel_id, guild_id, inbound).await;
        });
    }
}

/// Connect to the gateway and run until the connection dies or is aborted.
pub async fn run_gateway(token: String, router: Arc<MessageRouter>) -> Result<()> {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::DIRECT_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&token, intents)
        .event_handler(GatewayHandler { router })
        .await
        .map_err(TransportError::Discord)?;

    client.start().await.map_err(TransportError::Discord)?;
    Ok(())
}
