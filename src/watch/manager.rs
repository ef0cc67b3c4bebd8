//! Watch manager: global directory of channel registries and loop handles.
//!
//! Single source of truth for "does channel X have active watchers". Also
//! owns the per-channel watch-loop tasks and the independent stale sweep
//! that reaps expired watchers even when a loop has died.

use crate::watch::registry::ChannelRegistry;
use crate::watch::runner;
use crate::watch::watcher::{UpdateFrequency, Watcher, WatcherContext};
use crate::{ChannelId, GuildId, WatchDeps, WatcherId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio::time::Duration;

/// Global directory mapping channel → watch registry.
pub struct WatchManager {
    channels: RwLock<HashMap<ChannelId, Arc<ChannelRegistry>>>,
    loops: RwLock<HashMap<ChannelId, tokio::task::JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl std::fmt::Debug for WatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchManager").finish_non_exhaustive()
    }
}

impl Default for WatchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchManager {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            channels: RwLock::new(HashMap::new()),
            loops: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    /// Subscribe to the shutdown signal. Watch loops check it each tick.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Idempotent lookup-or-create. Calling twice with the same channel ID
    /// returns the same registry instance both times.
    pub async fn get_or_create_channel(&self, channel_id: &ChannelId) -> Arc<ChannelRegistry> {
        if let Some(registry) = self.channels.read().await.get(channel_id) {
            return Arc::clone(registry);
        }
        let mut channels = self.channels.write().await;
        Arc::clone(
            channels
                .entry(channel_id.clone())
                .or_insert_with(|| Arc::new(ChannelRegistry::new(channel_id.clone()))),
        )
    }

    pub async fn channel(&self, channel_id: &ChannelId) -> Option<Arc<ChannelRegistry>> {
        self.channels.read().await.get(channel_id).cloned()
    }

    /// False when no registry exists; otherwise true iff it holds watchers.
    pub async fn has_active_watchers(&self, channel_id: &ChannelId) -> bool {
        match self.channel(channel_id).await {
            Some(registry) => registry.watcher_count().await > 0,
            None => false,
        }
    }

    /// Create a watcher and register it into the channel's registry.
    ///
    /// The wait duration is clamped inside [`Watcher::new`].
    pub async fn create_watcher(
        &self,
        channel_id: ChannelId,
        guild_id: Option<GuildId>,
        context: WatcherContext,
        watching_for: String,
        wait_secs: u64,
        update_frequency: UpdateFrequency,
    ) -> Arc<Watcher> {
        let registry = self.get_or_create_channel(&channel_id).await;
        let watcher = Arc::new(Watcher::new(
            channel_id,
            guild_id,
            context,
            watching_for,
            wait_secs,
            update_frequency,
        ));
        registry.add_watcher(Arc::clone(&watcher)).await;
        tracing::info!(
            watcher_id = %watcher.id,
            channel_id = %registry.channel_id(),
            "watcher created"
        );
        watcher
    }

    /// Remove and return a watcher. Absence is not an error.
    pub async fn remove_watcher(
        &self,
        channel_id: &ChannelId,
        watcher_id: &WatcherId,
    ) -> Option<Arc<Watcher>> {
        let registry = self.channel(channel_id).await?;
        registry.remove_watcher(watcher_id).await
    }

    /// Sweep every registry for expired watchers and drop registries left
    /// with none. Returns the removals per channel. This is the safety net
    /// that runs independently of the watch loops.
    pub async fn cleanup_stale_watchers(&self) -> HashMap<ChannelId, Vec<Arc<Watcher>>> {
        let now = Utc::now();
        let registries: Vec<Arc<ChannelRegistry>> =
            self.channels.read().await.values().cloned().collect();

        let mut removed = HashMap::new();
        let mut empty = Vec::new();
        for registry in registries {
            let expired = registry.cleanup_expired_watchers(now).await;
            if !expired.is_empty() {
                removed.insert(registry.channel_id().clone(), expired);
            }
            if registry.watcher_count().await == 0 {
                empty.push(registry.channel_id().clone());
            }
        }

        if !empty.is_empty() {
            let mut channels = self.channels.write().await;
            for channel_id in empty {
                // Re-check under the write lock; a watcher may have been
                // registered between the sweep and here.
                if let Some(registry) = channels.get(&channel_id)
                    && registry.watcher_count().await == 0
                {
                    channels.remove(&channel_id);
                    tracing::debug!(channel_id = %channel_id, "empty registry removed");
                }
            }
        }

        removed
    }

    /// Make sure a watch loop is running for this channel. Idempotent:
    /// finished handles are pruned and replaced, live ones are left alone.
    pub async fn ensure_loop(&self, deps: &WatchDeps, channel_id: &ChannelId) {
        if *self.shutdown.borrow() {
            return;
        }
        let mut loops = self.loops.write().await;
        if let Some(handle) = loops.get(channel_id) {
            if !handle.is_finished() {
                return;
            }
            loops.remove(channel_id);
        }
        let handle = runner::spawn_watch_loop(deps.clone(), channel_id.clone());
        loops.insert(channel_id.clone(), handle);
        tracing::debug!(channel_id = %channel_id, "watch loop spawned");
    }

    /// Signal every watch loop to stop and wait for each to finish. Loops
    /// check the signal each tick, so an in-flight evaluation runs to
    /// completion instead of being cancelled at an arbitrary await point.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut loops = self.loops.write().await;
        for (channel_id, handle) in loops.drain() {
            if let Err(error) = handle.await {
                tracing::warn!(channel_id = %channel_id, %error, "watch loop task failed");
            } else {
                tracing::debug!(channel_id = %channel_id, "watch loop stopped");
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn loop_count(&self) -> usize {
        self.loops.read().await.len()
    }
}

/// Spawn the periodic stale-watcher sweep.
///
/// Runs until aborted. Each pass logs what it reaped; a watch loop dying
/// (ceiling breach, panic) leaves its watchers to expire here.
pub fn spawn_stale_sweep(
    manager: Arc<WatchManager>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let removed = manager.cleanup_stale_watchers().await;
            for (channel_id, watchers) in removed {
                for watcher in watchers {
                    let watching_for = watcher.watching_for().await;
                    tracing::info!(
                        channel_id = %channel_id,
                        watcher_id = %watcher.id,
                        %watching_for,
                        "stale watcher reaped"
                    );
                }
            }
        }
    })
}
