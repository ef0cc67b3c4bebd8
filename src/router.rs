//! Inbound message routing.
//!
//! Every user message lands here and takes exactly one of three paths:
//! a direct mention gets an immediate reply, a channel with active watchers
//! gets the message queued for the watch loop, and a quiet-but-hot channel
//! feeds the debounce scheduler. Nothing in this module propagates errors
//! upward; the gateway task must never die because one reply failed.

use crate::debounce::{BurstHandler, DebounceManager};
use crate::pipeline::{ChannelInfo, Intent, ResponseDirective, ResponseRequest, format_messages};
use crate::watch::WatcherContext;
use crate::watch::watcher::clamp_wait_secs;
use crate::{BotIdentity, ChannelId, GuildId, InboundMessage, Result, WatchDeps};
use std::sync::Arc;

pub struct MessageRouter {
    deps: WatchDeps,
    debounce: Arc<DebounceManager>,
}

impl MessageRouter {
    pub fn new(deps: WatchDeps, debounce: Arc<DebounceManager>) -> Arc<Self> {
        Arc::new(Self { deps, debounce })
    }

    pub fn identity(&self) -> &BotIdentity {
        &self.deps.identity
    }

    /// Route one inbound message. Called from a spawned task per message.
    pub async fn dispatch(
        &self,
        channel_id: ChannelId,
        guild_id: Option<GuildId>,
        message: InboundMessage,
    ) {
        if message.author_id == self.deps.identity.bot_id {
            return;
        }

        if message.is_mention {
            if let Err(error) = self.handle_mention(&channel_id, guild_id, &message).await {
                tracing::error!(channel_id = %channel_id, %error, "mention handling failed");
            }
            return;
        }

        if self.deps.manager.has_active_watchers(&channel_id).await {
            let registry = self.deps.manager.get_or_create_channel(&channel_id).await;
            registry.queue_message(message).await;
            return;
        }

        self.debounce.record_activity(&channel_id).await;
    }

    /// Reply to a direct mention, then optionally start watching the channel
    /// for follow-ups.
    async fn handle_mention(
        &self,
        channel_id: &ChannelId,
        guild_id: Option<GuildId>,
        message: &InboundMessage,
    ) -> Result<()> {
        tracing::info!(
            channel_id = %channel_id,
            author = %message.author_name,
            "handling mention"
        );

        // Typing indicator is cosmetic; a failure here is not a failure.
        if let Err(error) = self.deps.transport.start_typing(channel_id).await {
            tracing::debug!(%error, "could not start typing indicator");
        }

        let directive = self
            .respond_in_channel(channel_id, guild_id.clone(), Intent::ReplyToMention)
            .await?;

        if directive.continue_watching {
            self.start_watching(channel_id, guild_id, Some(message.id.clone()), &directive)
                .await;
        }
        Ok(())
    }

    /// Fetch context, run the response collaborator, and deliver its reply.
    async fn respond_in_channel(
        &self,
        channel_id: &ChannelId,
        guild_id: Option<GuildId>,
        intent: Intent,
    ) -> Result<ResponseDirective> {
        let recent = self
            .deps
            .transport
            .recent_messages(channel_id, self.deps.config.context_limit)
            .await?;

        let request = ResponseRequest {
            intent,
            messages: format_messages(&recent),
            context_summary: String::new(),
            channel: ChannelInfo {
                channel_id: channel_id.clone(),
                guild_id,
            },
            identity: self.deps.identity.clone(),
            personality_hint: None,
        };

        let directive = self.deps.pipeline.respond(request).await?;
        if !directive.response.trim().is_empty() {
            self.deps
                .transport
                .send_message(channel_id, &directive.response)
                .await?;
            self.debounce.note_bot_response(channel_id).await;
        }
        Ok(directive)
    }

    async fn start_watching(
        &self,
        channel_id: &ChannelId,
        guild_id: Option<GuildId>,
        trigger_message_id: Option<String>,
        directive: &ResponseDirective,
    ) {
        let context = WatcherContext {
            relevant_message_ids: trigger_message_id.iter().cloned().collect(),
            summary: directive.watching_for.clone(),
            trigger_message_id,
        };

        self.deps
            .manager
            .create_watcher(
                channel_id.clone(),
                guild_id,
                context,
                directive.watching_for.clone(),
                clamp_wait_secs(directive.wait_duration_secs),
                directive.update_frequency,
            )
            .await;
        self.deps.manager.ensure_loop(&self.deps, channel_id).await;
    }
}

#[async_trait::async_trait]
impl BurstHandler for MessageRouter {
    /// A message burst settled in a hot channel with no active watchers:
    /// decide whether to join the conversation.
    async fn handle_burst(&self, channel_id: ChannelId) -> Result<()> {
        // A watcher may have been created between burst arming and firing;
        // it already owns this channel's follow-ups.
        if self.deps.manager.has_active_watchers(&channel_id).await {
            return Ok(());
        }

        tracing::info!(channel_id = %channel_id, "joining settled conversation");

        let directive = self
            .respond_in_channel(&channel_id, None, Intent::JoinConversation)
            .await?;

        if directive.continue_watching {
            self.start_watching(&channel_id, None, None, &directive).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("identity", &self.deps.identity)
            .finish_non_exhaustive()
    }
}
