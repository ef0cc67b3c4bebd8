//! LLM-backed implementation of the watch pipeline.
//!
//! Two calls, two models: a cheap evaluation pass that decides whether new
//! messages warrant a reply, and a response pass that writes the reply and
//! directs what (if anything) to keep watching for. Both expect JSON back;
//! malformed output degrades to safe defaults rather than erroring.

use crate::llm::manager::LlmManager;
use crate::pipeline::parse;
use crate::pipeline::{
    EvaluationDecision, EvaluationRequest, ResponseDirective, ResponseRequest, WatchPipeline,
};
use crate::watch::UpdateFrequency;
use crate::Result;
use std::sync::Arc;

const EVALUATION_SYSTEM: &str = "\
You monitor a chat channel on behalf of a bot named {bot_name}. The bot \
recently participated in a conversation and is waiting to see whether a \
follow-up from it would be welcome.

You will be given what the bot is watching for, a summary of the earlier \
conversation, and the new messages that arrived since. Decide whether the \
bot should respond now.

Respond ONLY with a JSON object:
{
  \"should_respond\": true or false,
  \"relevant_message_ids\": [\"id\", ...],
  \"reasoning\": \"one sentence\",
  \"personality_hint\": \"optional tone guidance or null\"
}

Only respond when the new messages genuinely engage with what the bot is \
watching for. Idle chatter between other users is not a reason to respond.";

const RESPONSE_SYSTEM: &str = "\
You are {bot_name}, a helpful presence in a community chat. Write a reply \
that fits the conversation naturally. Keep it concise and conversational; \
this is chat, not prose.

After the reply, decide whether the bot should keep watching this channel \
for further follow-ups.

Respond ONLY with a JSON object:
{
  \"response\": \"the message to send, or empty string to stay silent\",
  \"continue_watching\": true or false,
  \"watching_for\": \"what a follow-up would look like\",
  \"wait_duration_secs\": 120,
  \"update_frequency\": \"10s\" | \"1m\" | \"5m\"
}";

pub struct LlmPipeline {
    manager: Arc<LlmManager>,
    evaluation_model: String,
    response_model: String,
}

impl LlmPipeline {
    pub fn new(manager: Arc<LlmManager>, evaluation_model: String, response_model: String) -> Self {
        Self {
            manager,
            evaluation_model,
            response_model,
        }
    }
}

#[async_trait::async_trait]
impl WatchPipeline for LlmPipeline {
    async fn evaluate(&self, request: EvaluationRequest) -> Result<EvaluationDecision> {
        let system = EVALUATION_SYSTEM.replace("{bot_name}", &request.identity.bot_name);
        let user = format!(
            "Watching for: {}\n\nEarlier conversation:\n{}\n\nNew messages:\n{}",
            request.watching_for,
            request.original_context,
            crate::pipeline::format_messages(&request.new_messages),
        );

        let output = self
            .manager
            .chat(&self.evaluation_model, &system, &user)
            .await?;

        let decision = match parse::extract_json(&output.content) {
            Some(value) => parse::parse_evaluation(&value),
            None => {
                tracing::warn!(
                    content = %truncate(&output.content, 200),
                    "evaluation output was not JSON, treating as no-response"
                );
                EvaluationDecision::no_response("unparseable evaluation output")
            }
        };

        tracing::debug!(
            should_respond = decision.should_respond,
            relevant = decision.relevant_message_ids.len(),
            tokens = output.tokens_used,
            "evaluation complete"
        );
        Ok(decision)
    }

    async fn respond(&self, request: ResponseRequest) -> Result<ResponseDirective> {
        let system = RESPONSE_SYSTEM.replace("{bot_name}", &request.identity.bot_name);
        let mut user = format!(
            "Intent: {}\n\nConversation context:\n{}\n\nRecent messages:\n{}",
            request.intent, request.context_summary, request.messages,
        );
        if let Some(hint) = &request.personality_hint {
            user.push_str("\n\nTone guidance: ");
            user.push_str(hint);
        }

        let output = self
            .manager
            .chat(&self.response_model, &system, &user)
            .await?;

        let mut directive = match parse::extract_json(&output.content) {
            Some(value) => parse::parse_directive(&value),
            None => {
                // A bare text reply still gets delivered; we just don't keep
                // watching on the strength of unstructured output.
                tracing::warn!("response output was not JSON, sending raw text");
                ResponseDirective {
                    response: output.content.trim().to_string(),
                    continue_watching: false,
                    watching_for: String::new(),
                    wait_duration_secs: parse::DEFAULT_WAIT_SECS,
                    update_frequency: UpdateFrequency::OneMinute,
                    tokens_used: 0,
                }
            }
        };
        directive.tokens_used = output.tokens_used;
        Ok(directive)
    }
}

impl std::fmt::Debug for LlmPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmPipeline")
            .field("evaluation_model", &self.evaluation_model)
            .field("response_model", &self.response_model)
            .finish_non_exhaustive()
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
