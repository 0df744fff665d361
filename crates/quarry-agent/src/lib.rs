//! # quarry-agent
//!
//! Agent provider harness for Quarry research runs.
//!
//! Every external research backend sits behind [`AgentProvider`]:
//! - `run` performs one attempt and reports soft failures as results
//! - `run_with_retry` adds the shared retry policy and the dry-run switch
//! - `resolve_credential` looks up configured secrets, then the environment
//!
//! Backends shipped here: remote HTTP services, external executables, and a
//! built-in search agent that drives tools through the run's `ToolManager`.

mod command;
mod factory;
mod http;
mod provider;
mod search;

pub use command::{CommandAgentProvider, CREDENTIAL_ENV};
pub use factory::build_agents;
pub use http::HttpAgentProvider;
pub use provider::{AgentProvider, AgentSettings, CredentialStore};
pub use search::SearchAgentProvider;
