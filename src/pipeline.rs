//! Collaborator contract for the evaluation and response pipeline.
//!
//! The watch subsystem never talks to an LLM directly; it hands structured
//! requests across this boundary and gets structured decisions back. The
//! shipped implementation lives in [`crate::llm`]; tests swap in mocks.

pub mod parse;

use crate::watch::watcher::UpdateFrequency;
use crate::{BotIdentity, ChannelId, GuildId, InboundMessage, Result};

/// Where in a conversation a response request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    /// The bot was mentioned directly.
    ReplyToMention,
    /// The debounce path decided to join ongoing chatter.
    JoinConversation,
    /// A watcher's evaluation said the thread is worth continuing.
    ContinueConversation,
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Intent::ReplyToMention => write!(f, "reply_to_mention"),
            Intent::JoinConversation => write!(f, "join_conversation"),
            Intent::ContinueConversation => write!(f, "continue_conversation"),
        }
    }
}

/// Channel metadata handed to the response collaborator.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
}

/// Input to the evaluation collaborator: should a watcher's new messages
/// produce a response?
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub watching_for: String,
    pub original_context: String,
    pub new_messages: Vec<InboundMessage>,
    pub identity: BotIdentity,
}

/// Evaluation collaborator output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationDecision {
    pub should_respond: bool,
    pub relevant_message_ids: Vec<String>,
    pub reasoning: String,
    pub personality_hint: Option<String>,
}

impl EvaluationDecision {
    /// The defensive fallback when the collaborator returns nothing usable.
    pub fn no_response(reasoning: impl Into<String>) -> Self {
        Self {
            should_respond: false,
            relevant_message_ids: Vec::new(),
            reasoning: reasoning.into(),
            personality_hint: None,
        }
    }
}

/// Input to the response collaborator.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    pub intent: Intent,
    /// Recent channel messages, already formatted as ordered records.
    pub messages: String,
    pub context_summary: String,
    pub channel: ChannelInfo,
    pub identity: BotIdentity,
    pub personality_hint: Option<String>,
}

/// Response collaborator output: the reply plus a continuation directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseDirective {
    pub response: String,
    pub continue_watching: bool,
    pub watching_for: String,
    /// Already clamped to the watcher's allowed range by the parser.
    pub wait_duration_secs: u64,
    pub update_frequency: UpdateFrequency,
    pub tokens_used: u64,
}

/// The evaluation/response pipeline boundary.
#[async_trait::async_trait]
pub trait WatchPipeline: Send + Sync {
    /// Decide whether a watcher's queued messages warrant a response.
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationDecision>;

    /// Generate a reply and a continuation directive.
    async fn respond(&self, request: ResponseRequest) -> Result<ResponseDirective>;
}

/// Format messages as ordered `[id] author (author_id) at time: content`
/// records, the shape both collaborators receive.
pub fn format_messages(messages: &[InboundMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&format!(
            "[{}] {} ({}) at {}: {}\n",
            message.id,
            message.author_name,
            message.author_id,
            message.timestamp.format("%Y-%m-%d %H:%M:%S"),
            message.content
        ));
    }
    out
}
