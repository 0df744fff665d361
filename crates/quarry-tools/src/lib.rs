//! Quarry Tools - Shared tool invocation layer
//!
//! This crate provides:
//! - Tool declarations and call arguments
//! - A TTL result cache keyed on canonical call arguments
//! - Domain allow-list enforcement for URL arguments
//! - HTTP-backed declarative tools
//! - The ToolManager pipeline (cache, policy, retry)

pub mod cache;
mod handler;
mod http;
mod manager;
pub mod policy;
mod spec;

pub use cache::{CacheStats, ToolCache};
pub use handler::{handler_fn, FnHandler, ToolHandler};
pub use http::HttpToolHandler;
pub use manager::ToolManager;
pub use spec::{ToolCall, ToolSpec};
