//! Chat transport boundary and the Discord adapter.

pub mod discord;
pub mod traits;

pub use traits::ChatTransport;
