//! LLM access: HTTP client plus the watch pipeline built on top of it.

pub mod manager;
pub mod pipeline;

pub use manager::LlmManager;
pub use pipeline::LlmPipeline;
