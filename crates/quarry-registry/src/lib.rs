//! Quarry Registry - Durable run state
//!
//! Tracks each run's snapshot (status, phase, per-agent status, cost) and its
//! append-only event log. Survives process restarts when file-backed.

mod registry;
mod store;

pub use registry::{ProviderUpdate, RunRegistry};
pub use store::{FileRunStore, MemoryRunStore, RunStore};
