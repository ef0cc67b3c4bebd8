//! Watcher subsystem: per-channel conversational state, scheduling, and expiry.

pub mod manager;
pub mod registry;
pub mod runner;
pub mod watcher;

pub use manager::{WatchManager, spawn_stale_sweep};
pub use registry::ChannelRegistry;
pub use watcher::{UpdateFrequency, Watcher, WatcherContext};
