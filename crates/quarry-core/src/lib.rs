//! # quarry-core
//!
//! Core types for the Quarry research-run engine.
//!
//! Quarry fans a research job out to several independent agents, shares one set
//! of callable tools between them, and records the run's progress durably.
//! This crate holds the vocabulary every other crate speaks:
//!
//! - Agent results, run snapshots, per-agent statuses and run events
//! - The unified [`QuarryError`] and its transient/non-transient classification
//! - Project configuration (`.quarry/config.toml`)
//! - The bounded retry combinator used at the tool and agent layers

pub mod config;
mod error;
pub mod fail_open;
pub mod retry;
mod types;

pub use config::{
    AgentConfig, AgentKind, QuarryConfig, RetryConfig, RunSettings, ToolConfig, CONFIG_PATH,
};
pub use error::{QuarryError, Result};
pub use retry::{with_retry, RetryOutcome, RetryPolicy};
pub use types::*;
