//! Per-channel registry: watcher set, pending-message buffer, consumed IDs.
//!
//! Everything in one registry is serialized under a single lock so the watch
//! loop never races message arrival or watcher removal. Registries for
//! different channels are fully independent.

use crate::watch::watcher::Watcher;
use crate::{ChannelId, InboundMessage, WatcherId};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Cap on the pending-message FIFO; the oldest entry is evicted on overflow.
pub const PENDING_CAP: usize = 50;

/// Pending messages older than this are discarded at drain time instead of
/// being replayed into a freshly created watcher.
pub const STALE_MESSAGE_SECS: i64 = 600;

/// Consumed-ID set compaction trigger.
const CONSUMED_CAP: usize = 1000;

/// How many consumed IDs survive a compaction (the most recently arrived).
const CONSUMED_KEEP: usize = 500;

/// Bounded set of message IDs already consumed by some watcher's trigger.
///
/// Recency is tracked by arrival order in an explicit ring, not by assuming
/// IDs are numeric and monotonic.
#[derive(Debug, Default)]
struct ConsumedSet {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

impl ConsumedSet {
    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        if self.order.len() > CONSUMED_CAP {
            while self.order.len() > CONSUMED_KEEP {
                if let Some(oldest) = self.order.pop_front() {
                    self.ids.remove(&oldest);
                }
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn len(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    watchers: HashMap<WatcherId, Arc<Watcher>>,
    pending: VecDeque<InboundMessage>,
    consumed: ConsumedSet,
}

/// One channel's watcher set, pending buffer, and consumed-ID set.
#[derive(Debug)]
pub struct ChannelRegistry {
    channel_id: ChannelId,
    inner: Mutex<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub async fn add_watcher(&self, watcher: Arc<Watcher>) {
        self.inner.lock().await.watchers.insert(watcher.id, watcher);
    }

    pub async fn remove_watcher(&self, id: &WatcherId) -> Option<Arc<Watcher>> {
        self.inner.lock().await.watchers.remove(id)
    }

    pub async fn get_watcher(&self, id: &WatcherId) -> Option<Arc<Watcher>> {
        self.inner.lock().await.watchers.get(id).cloned()
    }

    pub async fn watchers(&self) -> Vec<Arc<Watcher>> {
        self.inner.lock().await.watchers.values().cloned().collect()
    }

    pub async fn watcher_count(&self) -> usize {
        self.inner.lock().await.watchers.len()
    }

    /// Queue an inbound message for later fan-out.
    ///
    /// Messages whose ID is already consumed are silently rejected. When the
    /// FIFO is at capacity the oldest entry is evicted first, which bounds
    /// memory in a channel that is watched but never drained.
    pub async fn queue_message(&self, message: InboundMessage) {
        let mut inner = self.inner.lock().await;
        if inner.consumed.contains(&message.id) {
            tracing::debug!(
                channel_id = %self.channel_id,
                message_id = %message.id,
                "dropping already-consumed message"
            );
            return;
        }
        if inner.pending.len() >= PENDING_CAP {
            inner.pending.pop_front();
        }
        inner.pending.push_back(message);
    }

    /// Atomically drain the pending FIFO in arrival order.
    ///
    /// Messages older than [`STALE_MESSAGE_SECS`] and messages consumed after
    /// they were queued are discarded rather than returned.
    pub async fn get_pending_messages(&self, now: DateTime<Utc>) -> Vec<InboundMessage> {
        let mut inner = self.inner.lock().await;
        let drained = std::mem::take(&mut inner.pending);
        drained
            .into_iter()
            .filter(|message| {
                (now - message.timestamp).num_seconds() <= STALE_MESSAGE_SECS
                    && !inner.consumed.contains(&message.id)
            })
            .collect()
    }

    /// Record that a message ID was consumed by a watcher trigger, so neither
    /// the debounce path nor a later queue replays it.
    pub async fn mark_message_consumed(&self, id: &str) {
        self.inner.lock().await.consumed.insert(id);
    }

    pub async fn is_message_consumed(&self, id: &str) -> bool {
        self.inner.lock().await.consumed.contains(id)
    }

    /// Remove and return every watcher whose expiry has passed.
    pub async fn cleanup_expired_watchers(&self, now: DateTime<Utc>) -> Vec<Arc<Watcher>> {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for (id, watcher) in &inner.watchers {
            if watcher.is_expired(now).await {
                expired.push(*id);
            }
        }
        expired
            .into_iter()
            .filter_map(|id| inner.watchers.remove(&id))
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn consumed_len(&self) -> usize {
        self.inner.lock().await.consumed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watch::watcher::{UpdateFrequency, WatcherContext};
    use chrono::Duration;

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

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(ChannelId::from("1"))
    }

    fn watcher(wait_secs: u64) -> Arc<Watcher> {
        Arc::new(Watcher::new(
            ChannelId::from("1"),
            None,
            WatcherContext {
                relevant_message_ids: Vec::new(),
                summary: "context".into(),
                trigger_message_id: None,
            },
            "a follow-up".into(),
            wait_secs,
            UpdateFrequency::OneMinute,
        ))
    }

    #[tokio::test]
    async fn test_watcher_map_accounting() {
        let reg = registry();
        let a = watcher(60);
        let b = watcher(60);
        assert_ne!(a.id, b.id);

        reg.add_watcher(a.clone()).await;
        reg.add_watcher(b.clone()).await;
        assert_eq!(reg.watcher_count().await, 2);

        assert!(reg.remove_watcher(&a.id).await.is_some());
        assert!(reg.remove_watcher(&a.id).await.is_none());
        assert_eq!(reg.watcher_count().await, 1);
        assert!(reg.get_watcher(&b.id).await.is_some());
    }

    #[tokio::test]
    async fn test_pending_fifo_cap_keeps_newest_fifty() {
        let reg = registry();
        for i in 0..60 {
            reg.queue_message(message(&i.to_string())).await;
        }

        let drained = reg.get_pending_messages(Utc::now()).await;
        assert_eq!(drained.len(), PENDING_CAP);
        assert_eq!(drained.first().map(|m| m.id.as_str()), Some("10"));
        assert_eq!(drained.last().map(|m| m.id.as_str()), Some("59"));
    }

    #[tokio::test]
    async fn test_drain_is_atomic_and_preserves_order() {
        let reg = registry();
        reg.queue_message(message("1")).await;
        reg.queue_message(message("2")).await;
        reg.queue_message(message("3")).await;

        let drained = reg.get_pending_messages(Utc::now()).await;
        assert_eq!(
            drained.iter().map(|m| m.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2", "3"]
        );
        assert!(reg.get_pending_messages(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_drain_discards_ancient_backlog() {
        let reg = registry();
        let mut old = message("1");
        old.timestamp = Utc::now() - Duration::seconds(STALE_MESSAGE_SECS + 60);
        reg.queue_message(old).await;
        reg.queue_message(message("2")).await;

        let drained = reg.get_pending_messages(Utc::now()).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id, "2");
    }

    #[tokio::test]
    async fn test_consumed_ids_never_come_back() {
        let reg = registry();
        reg.mark_message_consumed("7").await;

        reg.queue_message(message("7")).await;
        assert!(reg.get_pending_messages(Utc::now()).await.is_empty());

        // Consumed after queueing is filtered at drain time too.
        reg.queue_message(message("8")).await;
        reg.mark_message_consumed("8").await;
        assert!(reg.get_pending_messages(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_consumed_set_compacts_by_arrival_order() {
        let reg = registry();
        for i in 0..(CONSUMED_CAP + 1) {
            reg.mark_message_consumed(&i.to_string()).await;
        }

        assert_eq!(reg.consumed_len().await, CONSUMED_KEEP);
        // The oldest arrivals were purged, the newest kept.
        assert!(!reg.is_message_consumed("0").await);
        assert!(reg.is_message_consumed(&CONSUMED_CAP.to_string()).await);
    }

    #[tokio::test]
    async fn test_cleanup_expired_watchers() {
        let reg = registry();
        let live = watcher(300);
        let dead = watcher(30);
        reg.add_watcher(live.clone()).await;
        reg.add_watcher(dead.clone()).await;

        // Present before expiry.
        assert!(reg.cleanup_expired_watchers(Utc::now()).await.is_empty());
        assert_eq!(reg.watcher_count().await, 2);

        dead.force_expire().await;
        let removed = reg.cleanup_expired_watchers(Utc::now()).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].id, dead.id);
        assert_eq!(reg.watcher_count().await, 1);
    }
}
