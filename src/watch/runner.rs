//! Per-channel watch loop: message fan-out, watcher evaluation, response
//! invocation.
//!
//! One loop runs per watched channel, started on demand and stopped when no
//! watchers remain. The loop never propagates an error across its task
//! boundary; every failure is logged and degraded (watcher removed, tick
//! skipped, loop stopped).

use crate::pipeline::{
    ChannelInfo, EvaluationRequest, Intent, ResponseDirective, ResponseRequest, format_messages,
};
use crate::watch::registry::ChannelRegistry;
use crate::watch::watcher::Watcher;
use crate::{ChannelId, Result, WatchDeps};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Duration;

/// Whether the loop should keep ticking.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    Stop,
}

/// Spawn the watch loop for a channel.
///
/// Runs until no watchers remain, the runtime ceiling is hit, or
/// [`crate::watch::WatchManager::shutdown`] raises the shutdown signal.
pub fn spawn_watch_loop(deps: WatchDeps, channel_id: ChannelId) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        run_watch_loop(deps, channel_id).await;
    })
}

async fn run_watch_loop(deps: WatchDeps, channel_id: ChannelId) {
    tracing::info!(channel_id = %channel_id, "watch loop started");

    let started = tokio::time::Instant::now();
    let ceiling = Duration::from_secs(deps.config.loop_ceiling_secs);
    let mut ticker = tokio::time::interval(Duration::from_secs(deps.config.tick_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = deps.manager.shutdown_signal();

    loop {
        // Cooperative stop: checked between ticks, never mid-evaluation.
        if *shutdown.borrow() {
            tracing::debug!(channel_id = %channel_id, "shutdown requested");
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => continue,
        }

        if started.elapsed() >= ceiling {
            tracing::warn!(
                channel_id = %channel_id,
                elapsed_secs = started.elapsed().as_secs(),
                "watch loop exceeded runtime ceiling, tearing down"
            );
            break;
        }

        if tick(&deps, &channel_id).await == TickOutcome::Stop {
            break;
        }
    }

    tracing::info!(channel_id = %channel_id, "watch loop stopped");
}

/// One tick: drain pending messages into every watcher, sweep expiries, and
/// evaluate whichever watchers are due.
pub(crate) async fn tick(deps: &WatchDeps, channel_id: &ChannelId) -> TickOutcome {
    let registry = deps.manager.get_or_create_channel(channel_id).await;

    if registry.watcher_count().await == 0 {
        tracing::debug!(channel_id = %channel_id, "no watchers left, stopping loop");
        return TickOutcome::Stop;
    }

    let now = Utc::now();
    let pending = registry.get_pending_messages(now).await;
    if !pending.is_empty() {
        // Broadcast, not partition: each watcher independently decides
        // relevance at evaluation time.
        for watcher in registry.watchers().await {
            watcher.extend_queue(pending.iter().cloned()).await;
        }
    }

    for expired in registry.cleanup_expired_watchers(now).await {
        let watching_for = expired.watching_for().await;
        tracing::info!(
            channel_id = %channel_id,
            watcher_id = %expired.id,
            %watching_for,
            "watcher expired"
        );
    }

    for watcher in registry.watchers().await {
        if watcher.should_evaluate(Utc::now()).await {
            evaluate_watcher(deps, &registry, &watcher).await;
        }
    }

    TickOutcome::Continue
}

/// Evaluate one due watcher and, when warranted, invoke the response
/// collaborator under the watcher's single-flight guard.
async fn evaluate_watcher(deps: &WatchDeps, registry: &ChannelRegistry, watcher: &Arc<Watcher>) {
    let batch = watcher.take_queue().await;
    if batch.is_empty() {
        return;
    }
    watcher.mark_evaluated(Utc::now()).await;

    let request = EvaluationRequest {
        watching_for: watcher.watching_for().await,
        original_context: watcher.context.summary.clone(),
        new_messages: batch,
        identity: deps.identity.clone(),
    };

    let decision = match deps.pipeline.evaluate(request).await {
        Ok(decision) => decision,
        Err(error) => {
            // Fail closed: an unreachable evaluator means this thread ends.
            tracing::warn!(
                channel_id = %watcher.channel_id,
                watcher_id = %watcher.id,
                %error,
                "evaluation failed, removing watcher"
            );
            registry.remove_watcher(&watcher.id).await;
            return;
        }
    };

    if !decision.should_respond {
        tracing::debug!(
            watcher_id = %watcher.id,
            reasoning = %decision.reasoning,
            "evaluation declined to respond"
        );
        return;
    }

    // Consumed before responding so the debounce path can't separately
    // re-trigger on the same messages.
    for id in &decision.relevant_message_ids {
        registry.mark_message_consumed(id).await;
    }

    let Some(_guard) = watcher.try_begin_response() else {
        tracing::debug!(
            watcher_id = %watcher.id,
            "response already in flight, skipping this round"
        );
        return;
    };

    match invoke_response(deps, watcher, decision.personality_hint).await {
        Ok(directive) if directive.continue_watching => {
            watcher
                .renew(
                    directive.watching_for.clone(),
                    directive.wait_duration_secs,
                    directive.update_frequency,
                    Utc::now(),
                )
                .await;
            tracing::info!(
                watcher_id = %watcher.id,
                watching_for = %directive.watching_for,
                wait_secs = directive.wait_duration_secs,
                "watcher renewed"
            );
        }
        Ok(_) => {
            registry.remove_watcher(&watcher.id).await;
            tracing::info!(watcher_id = %watcher.id, "watcher retired by directive");
        }
        Err(error) => {
            // Never leave a half-updated watcher behind; the user can
            // re-mention the bot to start a fresh thread.
            registry.remove_watcher(&watcher.id).await;
            tracing::warn!(
                watcher_id = %watcher.id,
                %error,
                "response invocation failed, watcher removed"
            );
        }
    }
    // _guard drops here, releasing the responding flag on every path.
}

/// Build the channel's full recent context and run the response collaborator.
///
/// The broader context (not just the filtered relevant subset) is deliberate:
/// the responder needs situational awareness beyond the trigger messages.
async fn invoke_response(
    deps: &WatchDeps,
    watcher: &Arc<Watcher>,
    personality_hint: Option<String>,
) -> Result<ResponseDirective> {
    let recent = deps
        .transport
        .recent_messages(&watcher.channel_id, deps.config.context_limit)
        .await?;

    let request = ResponseRequest {
        intent: Intent::ContinueConversation,
        messages: format_messages(&recent),
        context_summary: watcher.context.summary.clone(),
        channel: ChannelInfo {
            channel_id: watcher.channel_id.clone(),
            guild_id: watcher.guild_id.clone(),
        },
        identity: deps.identity.clone(),
        personality_hint,
    };

    let directive = deps.pipeline.respond(request).await?;
    if !directive.response.trim().is_empty() {
        deps.transport
            .send_message(&watcher.channel_id, &directive.response)
            .await?;
    }
    Ok(directive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchConfig;
    use crate::messaging::ChatTransport;
    use crate::pipeline::{EvaluationDecision, WatchPipeline};
    use crate::watch::WatchManager;
    use crate::watch::watcher::{UpdateFrequency, WatcherContext};
    use crate::{BotIdentity, InboundMessage};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockPipeline {
        decision: Mutex<EvaluationDecision>,
        directive: Mutex<ResponseDirective>,
        evaluate_calls: AtomicUsize,
        respond_calls: AtomicUsize,
    }

    impl MockPipeline {
        fn new(decision: EvaluationDecision, directive: ResponseDirective) -> Arc<Self> {
            Arc::new(Self {
                decision: Mutex::new(decision),
                directive: Mutex::new(directive),
                evaluate_calls: AtomicUsize::new(0),
                respond_calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait::async_trait]
    impl WatchPipeline for MockPipeline {
        async fn evaluate(&self, _request: EvaluationRequest) -> Result<EvaluationDecision> {
            self.evaluate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decision.lock().expect("mock lock").clone())
        }

        async fn respond(&self, _request: ResponseRequest) -> Result<ResponseDirective> {
            self.respond_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.directive.lock().expect("mock lock").clone())
        }
    }

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ChatTransport for MockTransport {
        async fn recent_messages(
            &self,
            _channel_id: &ChannelId,
            _limit: u8,
        ) -> Result<Vec<InboundMessage>> {
            Ok(Vec::new())
        }

        async fn send_message(&self, _channel_id: &ChannelId, text: &str) -> Result<String> {
            self.sent.lock().expect("mock lock").push(text.to_string());
            Ok("900".into())
        }
    }

    fn message(id: &str) -> InboundMessage {
        InboundMessage {
            id: id.into(),
            author_id: "100".into(),
            author_name: "alice".into(),
            content: format!("message {id}"),
            timestamp: Utc::now(),
            is_mention: false,
        }
    }

    fn directive(continue_watching: bool) -> ResponseDirective {
        ResponseDirective {
            response: "got it, here's more detail".into(),
            continue_watching,
            watching_for: "further questions".into(),
            wait_duration_secs: 60,
            update_frequency: UpdateFrequency::OneMinute,
            tokens_used: 10,
        }
    }

    struct Fixture {
        deps: WatchDeps,
        pipeline: Arc<MockPipeline>,
        transport: Arc<MockTransport>,
    }

    fn fixture(decision: EvaluationDecision, dir: ResponseDirective) -> Fixture {
        let pipeline = MockPipeline::new(decision, dir);
        let transport = Arc::new(MockTransport::default());
        let deps = WatchDeps {
            manager: Arc::new(WatchManager::new()),
            pipeline: pipeline.clone(),
            transport: transport.clone(),
            identity: BotIdentity {
                bot_id: "999".into(),
                bot_name: "vigil".into(),
            },
            config: WatchConfig::default(),
        };
        Fixture {
            deps,
            pipeline,
            transport,
        }
    }

    async fn create_watcher(deps: &WatchDeps, channel: &str) -> Arc<Watcher> {
        deps.manager
            .create_watcher(
                ChannelId::from(channel),
                None,
                WatcherContext {
                    relevant_message_ids: vec!["10".into()],
                    summary: "user asked about X".into(),
                    trigger_message_id: Some("10".into()),
                },
                "clarification on X".into(),
                60,
                UpdateFrequency::TenSeconds,
            )
            .await
    }

    #[tokio::test]
    async fn test_tick_stops_without_watchers() {
        let f = fixture(EvaluationDecision::no_response("idle"), directive(false));
        let outcome = tick(&f.deps, &ChannelId::from("1")).await;
        assert_eq!(outcome, TickOutcome::Stop);
    }

    #[tokio::test]
    async fn test_tick_fans_pending_messages_into_every_watcher() {
        let f = fixture(EvaluationDecision::no_response("idle"), directive(false));
        let channel = ChannelId::from("1");
        let a = create_watcher(&f.deps, "1").await;
        let b = create_watcher(&f.deps, "1").await;

        let registry = f.deps.manager.get_or_create_channel(&channel).await;
        registry.queue_message(message("11")).await;
        registry.queue_message(message("12")).await;

        // Fresh watchers with `last_evaluation_at = None` are due immediately,
        // so the mock evaluator runs; it declines, leaving both alive.
        assert_eq!(tick(&f.deps, &channel).await, TickOutcome::Continue);
        assert_eq!(f.pipeline.evaluate_calls.load(Ordering::SeqCst), 2);
        assert_eq!(a.queue_len().await, 0);
        assert_eq!(b.queue_len().await, 0);
        assert_eq!(registry.watcher_count().await, 2);
    }

    #[tokio::test]
    async fn test_end_to_end_respond_and_retire() {
        let decision = EvaluationDecision {
            should_respond: true,
            relevant_message_ids: vec!["11".into(), "12".into(), "13".into()],
            reasoning: "they followed up".into(),
            personality_hint: Some("casual".into()),
        };
        let f = fixture(decision, directive(false));
        let channel = ChannelId::from("1");
        let watcher = create_watcher(&f.deps, "1").await;

        let registry = f.deps.manager.get_or_create_channel(&channel).await;
        for id in ["11", "12", "13"] {
            registry.queue_message(message(id)).await;
        }

        tick(&f.deps, &channel).await;

        // Response collaborator ran exactly once and the reply was sent.
        assert_eq!(f.pipeline.respond_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.transport.sent.lock().expect("lock").len(), 1);

        // All three IDs were consumed.
        for id in ["11", "12", "13"] {
            assert!(registry.is_message_consumed(id).await);
        }

        // continue_watching = false retired the watcher.
        assert!(registry.get_watcher(&watcher.id).await.is_none());
    }

    #[tokio::test]
    async fn test_continue_watching_renews_in_place() {
        let decision = EvaluationDecision {
            should_respond: true,
            relevant_message_ids: vec!["11".into()],
            reasoning: "worth continuing".into(),
            personality_hint: None,
        };
        let mut dir = directive(true);
        dir.wait_duration_secs = 240;
        let f = fixture(decision, dir);
        let channel = ChannelId::from("1");
        let watcher = create_watcher(&f.deps, "1").await;

        let registry = f.deps.manager.get_or_create_channel(&channel).await;
        registry.queue_message(message("11")).await;
        let old_expiry = watcher.expires_at().await;

        tick(&f.deps, &channel).await;

        assert!(registry.get_watcher(&watcher.id).await.is_some());
        assert_eq!(watcher.watching_for().await, "further questions");
        assert_eq!(watcher.wait_secs().await, 240);
        assert!(watcher.expires_at().await > old_expiry);
        assert!(!watcher.is_responding());
    }

    #[tokio::test]
    async fn test_in_flight_response_skips_second_evaluation() {
        let decision = EvaluationDecision {
            should_respond: true,
            relevant_message_ids: vec!["11".into()],
            reasoning: "respond".into(),
            personality_hint: None,
        };
        let f = fixture(decision, directive(true));
        let channel = ChannelId::from("1");
        let watcher = create_watcher(&f.deps, "1").await;

        let registry = f.deps.manager.get_or_create_channel(&channel).await;
        registry.queue_message(message("11")).await;

        // Simulate a slow response still in flight from a previous tick.
        let guard = watcher.try_begin_response().expect("guard free");
        tick(&f.deps, &channel).await;

        // should_evaluate() saw the responding flag and skipped entirely.
        assert_eq!(f.pipeline.evaluate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(f.pipeline.respond_calls.load(Ordering::SeqCst), 0);

        drop(guard);
        tick(&f.deps, &channel).await;
        assert_eq!(f.pipeline.respond_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pipeline_error_removes_watcher_and_releases_guard() {
        struct FailingPipeline;

        #[async_trait::async_trait]
        impl WatchPipeline for FailingPipeline {
            async fn evaluate(&self, _request: EvaluationRequest) -> Result<EvaluationDecision> {
                Ok(EvaluationDecision {
                    should_respond: true,
                    relevant_message_ids: vec!["11".into()],
                    reasoning: "respond".into(),
                    personality_hint: None,
                })
            }

            async fn respond(&self, _request: ResponseRequest) -> Result<ResponseDirective> {
                Err(crate::error::LlmError::ProviderRequest("boom".into()).into())
            }
        }

        let transport = Arc::new(MockTransport::default());
        let deps = WatchDeps {
            manager: Arc::new(WatchManager::new()),
            pipeline: Arc::new(FailingPipeline),
            transport,
            identity: BotIdentity {
                bot_id: "999".into(),
                bot_name: "vigil".into(),
            },
            config: WatchConfig::default(),
        };
        let channel = ChannelId::from("1");
        let watcher = create_watcher(&deps, "1").await;

        let registry = deps.manager.get_or_create_channel(&channel).await;
        registry.queue_message(message("11")).await;

        tick(&deps, &channel).await;

        // Fail-closed: watcher removed, flag released.
        assert!(registry.get_watcher(&watcher.id).await.is_none());
        assert!(!watcher.is_responding());
    }

    #[tokio::test]
    async fn test_shutdown_joins_loops_and_blocks_new_ones() {
        let f = fixture(EvaluationDecision::no_response("idle"), directive(false));
        let channel = ChannelId::from("1");
        create_watcher(&f.deps, "1").await;
        f.deps.manager.ensure_loop(&f.deps, &channel).await;

        // Returns only once the loop has observed the signal and exited.
        f.deps.manager.shutdown().await;
        assert_eq!(f.deps.manager.loop_count().await, 0);

        // No new loops start after shutdown.
        f.deps.manager.ensure_loop(&f.deps, &channel).await;
        assert_eq!(f.deps.manager.loop_count().await, 0);
    }

    #[tokio::test]
    async fn test_expired_watcher_swept_before_evaluation() {
        let f = fixture(EvaluationDecision::no_response("idle"), directive(false));
        let channel = ChannelId::from("1");
        let watcher = create_watcher(&f.deps, "1").await;
        watcher.force_expire().await;

        let registry = f.deps.manager.get_or_create_channel(&channel).await;
        registry.queue_message(message("11")).await;

        tick(&f.deps, &channel).await;

        assert!(registry.get_watcher(&watcher.id).await.is_none());
        assert_eq!(f.pipeline.evaluate_calls.load(Ordering::SeqCst), 0);
    }
}
