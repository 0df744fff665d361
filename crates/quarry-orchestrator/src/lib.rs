//! # quarry-orchestrator
//!
//! Executes research runs for Quarry.
//!
//! This crate provides:
//! - Job context loading
//! - Concurrent agent fan-out with a hard per-agent timeout
//! - Failure isolation: every agent yields a result, in schedule order
//! - Phase and per-agent progress recorded in the run registry

mod context;
mod orchestrator;

pub use context::{ContextLoader, FileContextLoader, StaticContextLoader};
pub use orchestrator::{
    Orchestrator, OrchestratorConfig, RunOutcome, RunRequest, PHASE_AGGREGATING,
    PHASE_LOADING_CONTEXT, PHASE_RUNNING_AGENTS,
};
