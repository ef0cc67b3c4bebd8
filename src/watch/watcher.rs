//! A watcher is one open conversational thread the bot is monitoring.
//!
//! Each watcher carries the context it was created from, a private queue of
//! not-yet-evaluated messages, and a single-flight guard around response
//! invocation. Evaluation cadence and expiry are driven by the watch loop;
//! the watcher itself only answers "am I due" and "am I expired".

use crate::{ChannelId, GuildId, InboundMessage, WatcherId};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

/// Minimum seconds a watcher waits for a qualifying message before expiring.
pub const MIN_WAIT_SECS: u64 = 30;

/// Maximum seconds a watcher waits for a qualifying message before expiring.
pub const MAX_WAIT_SECS: u64 = 300;

/// Clamp a wait duration into the allowed `[MIN_WAIT_SECS, MAX_WAIT_SECS]`
/// range. Applied at creation and at every renewal, never skipped.
pub fn clamp_wait_secs(secs: u64) -> u64 {
    secs.clamp(MIN_WAIT_SECS, MAX_WAIT_SECS)
}

/// Minimum spacing between evaluations of one watcher's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateFrequency {
    TenSeconds,
    OneMinute,
    FiveMinutes,
}

impl UpdateFrequency {
    pub fn as_secs(self) -> i64 {
        match self {
            UpdateFrequency::TenSeconds => 10,
            UpdateFrequency::OneMinute => 60,
            UpdateFrequency::FiveMinutes => 300,
        }
    }
}

impl std::fmt::Display for UpdateFrequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateFrequency::TenSeconds => write!(f, "10s"),
            UpdateFrequency::OneMinute => write!(f, "1m"),
            UpdateFrequency::FiveMinutes => write!(f, "5m"),
        }
    }
}

/// The context a watcher was created from. Immutable for its lifetime.
#[derive(Debug, Clone)]
pub struct WatcherContext {
    /// Message IDs judged relevant when the watcher was created.
    pub relevant_message_ids: Vec<String>,
    /// Free-text summary of that context.
    pub summary: String,
    /// ID of the message that originally triggered the watcher.
    pub trigger_message_id: Option<String>,
}

/// Mutable watcher state, updated on evaluation and renewal.
#[derive(Debug, Clone)]
struct WatcherState {
    watching_for: String,
    wait_secs: u64,
    update_frequency: UpdateFrequency,
    expires_at: DateTime<Utc>,
    last_evaluation_at: Option<DateTime<Utc>>,
}

/// One open conversational thread the bot is monitoring.
pub struct Watcher {
    pub id: WatcherId,
    pub channel_id: ChannelId,
    pub guild_id: Option<GuildId>,
    pub context: WatcherContext,
    pub created_at: DateTime<Utc>,
    state: RwLock<WatcherState>,
    queue: Mutex<Vec<InboundMessage>>,
    responding: AtomicBool,
}

impl std::fmt::Debug for Watcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("id", &self.id)
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

impl Watcher {
    pub fn new(
        channel_id: ChannelId,
        guild_id: Option<GuildId>,
        context: WatcherContext,
        watching_for: String,
        wait_secs: u64,
        update_frequency: UpdateFrequency,
    ) -> Self {
        let wait_secs = clamp_wait_secs(wait_secs);
        let created_at = Utc::now();

        Self {
            id: uuid::Uuid::new_v4(),
            channel_id,
            guild_id,
            context,
            created_at,
            state: RwLock::new(WatcherState {
                watching_for,
                wait_secs,
                update_frequency,
                expires_at: created_at + Duration::seconds(wait_secs as i64),
                last_evaluation_at: None,
            }),
            queue: Mutex::new(Vec::new()),
            responding: AtomicBool::new(false),
        }
    }

    /// What follow-up this watcher is currently listening for.
    pub async fn watching_for(&self) -> String {
        self.state.read().await.watching_for.clone()
    }

    pub async fn wait_secs(&self) -> u64 {
        self.state.read().await.wait_secs
    }

    pub async fn expires_at(&self) -> DateTime<Utc> {
        self.state.read().await.expires_at
    }

    pub async fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.state.read().await.expires_at
    }

    /// Whether this watcher is due for evaluation: not currently responding,
    /// at least one queued message, and past its update-frequency spacing.
    pub async fn should_evaluate(&self, now: DateTime<Utc>) -> bool {
        if self.responding.load(Ordering::Acquire) {
            return false;
        }
        if self.queue.lock().await.is_empty() {
            return false;
        }
        let state = self.state.read().await;
        match state.last_evaluation_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= state.update_frequency.as_secs(),
        }
    }

    /// Stamp the evaluation time for cadence tracking.
    pub async fn mark_evaluated(&self, now: DateTime<Utc>) {
        self.state.write().await.last_evaluation_at = Some(now);
    }

    /// Renew the watcher in place: new listening target, clamped wait
    /// duration, new cadence, and a fresh expiry from `now`.
    pub async fn renew(
        &self,
        watching_for: String,
        wait_secs: u64,
        update_frequency: UpdateFrequency,
        now: DateTime<Utc>,
    ) {
        let wait_secs = clamp_wait_secs(wait_secs);
        let mut state = self.state.write().await;
        state.watching_for = watching_for;
        state.wait_secs = wait_secs;
        state.update_frequency = update_frequency;
        state.expires_at = now + Duration::seconds(wait_secs as i64);
    }

    /// Append a batch of drained channel messages to this watcher's queue,
    /// preserving arrival order.
    pub async fn extend_queue(&self, messages: impl IntoIterator<Item = InboundMessage>) {
        self.queue.lock().await.extend(messages);
    }

    /// Snapshot and clear the private queue. The batch is consumed for this
    /// evaluation round regardless of its outcome.
    pub async fn take_queue(&self) -> Vec<InboundMessage> {
        std::mem::take(&mut *self.queue.lock().await)
    }

    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Try to acquire the single-flight response guard. Returns `None` when a
    /// response invocation is already in flight; callers skip the round
    /// rather than queueing a retry.
    pub fn try_begin_response(self: &Arc<Self>) -> Option<ResponseGuard> {
        self.responding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ResponseGuard {
                watcher: Arc::clone(self),
            })
    }

    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) async fn force_expire(&self) {
        self.state.write().await.expires_at = Utc::now() - Duration::seconds(1);
    }
}

/// RAII guard that clears the watcher's responding flag on drop, so the flag
/// is released on every exit path including panics.
pub struct ResponseGuard {
    watcher: Arc<Watcher>,
}

impl Drop for ResponseGuard {
    fn drop(&mut self) {
        self.watcher.responding.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: &str) -> InboundMessage {
        InboundMessage {
            id: id.into(),
            author_id: "100".into(),
            author_name: "alice".into(),
            content: "hello".into(),
            timestamp: Utc::now(),
            is_mention: false,
        }
    }

    fn watcher(wait_secs: u64) -> Watcher {
        Watcher::new(
            ChannelId::from("1"),
            Some(GuildId::from("2")),
            WatcherContext {
                relevant_message_ids: vec!["10".into()],
                summary: "talking about deploys".into(),
                trigger_message_id: Some("10".into()),
            },
            "clarification on the deploy".into(),
            wait_secs,
            UpdateFrequency::TenSeconds,
        )
    }

    #[test]
    fn test_clamp_wait_secs_bounds() {
        assert_eq!(clamp_wait_secs(0), MIN_WAIT_SECS);
        assert_eq!(clamp_wait_secs(29), MIN_WAIT_SECS);
        assert_eq!(clamp_wait_secs(30), 30);
        assert_eq!(clamp_wait_secs(120), 120);
        assert_eq!(clamp_wait_secs(300), 300);
        assert_eq!(clamp_wait_secs(301), MAX_WAIT_SECS);
        assert_eq!(clamp_wait_secs(u64::MAX), MAX_WAIT_SECS);
    }

    #[tokio::test]
    async fn test_creation_clamps_and_stamps_expiry() {
        let w = watcher(5);
        assert_eq!(w.wait_secs().await, MIN_WAIT_SECS);
        assert_eq!(
            w.expires_at().await,
            w.created_at + Duration::seconds(MIN_WAIT_SECS as i64)
        );

        let w = watcher(9999);
        assert_eq!(w.wait_secs().await, MAX_WAIT_SECS);
    }

    #[tokio::test]
    async fn test_renew_clamps_and_recomputes_expiry() {
        let w = watcher(60);
        let now = Utc::now() + Duration::seconds(10);
        w.renew("follow-up".into(), 1000, UpdateFrequency::FiveMinutes, now)
            .await;
        assert_eq!(w.wait_secs().await, MAX_WAIT_SECS);
        assert_eq!(w.expires_at().await, now + Duration::seconds(300));
        assert_eq!(w.watching_for().await, "follow-up");
    }

    #[tokio::test]
    async fn test_should_evaluate_requires_queued_messages() {
        let w = watcher(60);
        assert!(!w.should_evaluate(Utc::now()).await);

        w.extend_queue([message("11")]).await;
        assert!(w.should_evaluate(Utc::now()).await);
    }

    #[tokio::test]
    async fn test_should_evaluate_honors_update_frequency() {
        let w = watcher(60);
        w.extend_queue([message("11")]).await;

        let now = Utc::now();
        w.mark_evaluated(now).await;
        assert!(!w.should_evaluate(now + Duration::seconds(5)).await);
        assert!(w.should_evaluate(now + Duration::seconds(10)).await);
    }

    #[tokio::test]
    async fn test_should_evaluate_skips_while_responding() {
        let w = Arc::new(watcher(60));
        w.extend_queue([message("11")]).await;

        let guard = w.try_begin_response().expect("guard should be free");
        assert!(!w.should_evaluate(Utc::now()).await);

        drop(guard);
        assert!(w.should_evaluate(Utc::now()).await);
    }

    #[tokio::test]
    async fn test_response_guard_is_single_flight() {
        let w = Arc::new(watcher(60));
        let first = w.try_begin_response();
        assert!(first.is_some());
        assert!(w.try_begin_response().is_none());
        assert!(w.is_responding());

        drop(first);
        assert!(!w.is_responding());
        assert!(w.try_begin_response().is_some());
    }

    #[tokio::test]
    async fn test_take_queue_drains() {
        let w = watcher(60);
        w.extend_queue([message("11"), message("12")]).await;

        let batch = w.take_queue().await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, "11");
        assert_eq!(w.queue_len().await, 0);
    }
}
