//! Debounced conversation-continuation scheduler.
//!
//! After the bot speaks in a channel, that channel stays "hot" for a window.
//! While hot, incoming user messages arm a rolling timer: each new message
//! pushes the fire time back, but never past a hard cap measured from the
//! first message of the burst. When the timer fires, the registered
//! [`BurstHandler`] gets one shot at joining the conversation.

use crate::config::DebounceConfig;
use crate::{ChannelId, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};

/// Callback invoked when a message burst settles in a hot channel.
#[async_trait::async_trait]
pub trait BurstHandler: Send + Sync {
    async fn handle_burst(&self, channel_id: ChannelId) -> Result<()>;
}

#[derive(Default)]
struct ActivityState {
    /// Channel is hot until this instant. `None` means the bot has not
    /// spoken here yet.
    watching_until: Option<Instant>,
    /// First message of the current burst; anchors the hard cap.
    first_message_at: Option<Instant>,
    last_message_at: Option<Instant>,
    timer: Option<tokio::task::JoinHandle<()>>,
    /// Messages arrived while a burst was being handled.
    arrived_during_run: bool,
}

struct ChannelActivity {
    channel_id: ChannelId,
    running: AtomicBool,
    state: Mutex<ActivityState>,
}

/// Per-channel debounce state and timer ownership.
pub struct DebounceManager {
    channels: RwLock<HashMap<ChannelId, Arc<ChannelActivity>>>,
    config: DebounceConfig,
    handler: OnceLock<Arc<dyn BurstHandler>>,
}

impl DebounceManager {
    pub fn new(config: DebounceConfig) -> Arc<Self> {
        Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            config,
            handler: OnceLock::new(),
        })
    }

    /// Register the burst handler. The manager and its handler reference each
    /// other, so the handler is attached after both are constructed.
    pub fn set_handler(&self, handler: Arc<dyn BurstHandler>) {
        if self.handler.set(handler).is_err() {
            tracing::warn!("burst handler already registered, ignoring");
        }
    }

    async fn activity(&self, channel_id: &ChannelId) -> Arc<ChannelActivity> {
        if let Some(activity) = self.channels.read().await.get(channel_id) {
            return activity.clone();
        }
        let mut channels = self.channels.write().await;
        channels
            .entry(channel_id.clone())
            .or_insert_with(|| {
                Arc::new(ChannelActivity {
                    channel_id: channel_id.clone(),
                    running: AtomicBool::new(false),
                    state: Mutex::new(ActivityState::default()),
                })
            })
            .clone()
    }

    /// Mark a channel hot: the bot just sent a message here.
    pub async fn note_bot_response(&self, channel_id: &ChannelId) {
        let activity = self.activity(channel_id).await;
        let mut state = activity.state.lock().await;
        state.watching_until = Some(Instant::now() + Duration::from_secs(self.config.hot_window_secs));
    }

    /// Record a user message and (re)arm the burst timer if the channel is hot.
    pub async fn record_activity(self: &Arc<Self>, channel_id: &ChannelId) {
        let activity = self.activity(channel_id).await;
        let mut state = activity.state.lock().await;

        if activity.running.load(Ordering::Acquire) {
            state.arrived_during_run = true;
            return;
        }

        let now = Instant::now();
        match state.watching_until {
            Some(until) if until > now => {}
            _ => return, // cold channel, unsolicited joins are out of scope
        }

        if state.first_message_at.is_none() {
            state.first_message_at = Some(now);
        }
        state.last_message_at = Some(now);

        // Dropping a JoinHandle only detaches it; abort the old timer so a
        // superseded delay can never fire.
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        let since_first = now - state.first_message_at.unwrap_or(now);
        let max_delay = Duration::from_secs(self.config.max_delay_secs);
        let delay = if since_first >= max_delay {
            Duration::ZERO
        } else {
            Duration::from_secs(self.config.initial_delay_secs).min(max_delay - since_first)
        };

        // Absolute deadline, fixed while the lock is held; sleeping for a
        // relative delay inside the task would measure from first poll and
        // drift by the spawn latency.
        let deadline = now + delay;
        let manager = self.clone();
        let activity_for_timer = activity.clone();
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            manager.fire(activity_for_timer).await;
        }));
    }

    /// Timer expiry: hand the burst to the handler, single-flight per channel.
    async fn fire(self: Arc<Self>, activity: Arc<ChannelActivity>) {
        if activity
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let mut state = activity.state.lock().await;
            state.arrived_during_run = true;
            state.timer = None;
            return;
        }

        struct RunGuard(Arc<ChannelActivity>);
        impl Drop for RunGuard {
            fn drop(&mut self) {
                self.0.running.store(false, Ordering::Release);
            }
        }
        let _guard = RunGuard(activity.clone());

        let channel_id = activity.channel_id.clone();
        let burst_span = {
            let mut state = activity.state.lock().await;
            state.timer = None;
            let span = match (state.first_message_at, state.last_message_at) {
                (Some(first), Some(last)) => last.duration_since(first),
                _ => Duration::ZERO,
            };
            state.first_message_at = None;
            state.last_message_at = None;
            state.arrived_during_run = false;
            span
        };
        tracing::debug!(
            channel_id = %channel_id,
            burst_span_secs = burst_span.as_secs(),
            "message burst settled"
        );

        match self.handler.get() {
            Some(handler) => {
                if let Err(error) = handler.handle_burst(channel_id.clone()).await {
                    tracing::error!(channel_id = %channel_id, %error, "burst handler failed");
                }
            }
            None => tracing::warn!(channel_id = %channel_id, "burst fired with no handler registered"),
        }

        // The hot window is only ever advanced by note_bot_response, so a
        // burst that produced no reply lets the channel go cold on schedule.
        let mut state = activity.state.lock().await;
        if state.arrived_during_run {
            // Not re-armed here: the next message starts a fresh burst.
            tracing::debug!(
                channel_id = %channel_id,
                "messages arrived during burst handling"
            );
            state.arrived_during_run = false;
        }
    }

    /// Drop state for channels that are cold and have no burst in progress.
    pub async fn cleanup_idle(&self) {
        let now = Instant::now();
        let mut channels = self.channels.write().await;
        let mut idle = Vec::new();
        for (id, activity) in channels.iter() {
            if activity.running.load(Ordering::Acquire) {
                continue;
            }
            let state = activity.state.lock().await;
            let cold = match state.watching_until {
                Some(until) => until <= now,
                None => true,
            };
            if cold && state.timer.is_none() {
                idle.push(id.clone());
            }
        }
        for id in idle {
            channels.remove(&id);
        }
    }

    /// Abort all pending timers.
    pub async fn shutdown(&self) {
        let channels = self.channels.read().await;
        for activity in channels.values() {
            let mut state = activity.state.lock().await;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
    }
}

/// Spawn the periodic idle-channel sweep. Runs until aborted.
pub fn spawn_idle_sweep(
    manager: Arc<DebounceManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            manager.cleanup_idle().await;
        }
    })
}

impl std::fmt::Debug for DebounceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
