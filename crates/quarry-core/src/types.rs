//! Core type definitions for Quarry research runs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::QuarryError;

/// Run identifier (UUID v4 string unless supplied by the caller)
pub type RunId = String;

/// Outcome of a single agent run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Completed,
    Partial,
    Failed,
    Timeout,
    DryRun,
    ConfigurationError,
    DependencyMissing,
}

impl AgentRunStatus {
    /// Registry status recorded for an agent that finished with this outcome
    pub fn provider_state(&self) -> ProviderState {
        match self {
            Self::Completed | Self::Partial | Self::DryRun => ProviderState::Completed,
            Self::Failed | Self::ConfigurationError | Self::DependencyMissing => {
                ProviderState::Failed
            }
            Self::Timeout => ProviderState::Timeout,
        }
    }
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Partial => write!(f, "partial"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::DryRun => write!(f, "dry_run"),
            Self::ConfigurationError => write!(f, "configuration_error"),
            Self::DependencyMissing => write!(f, "dependency_missing"),
        }
    }
}

impl std::str::FromStr for AgentRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "completed" => Ok(Self::Completed),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            "dry_run" => Ok(Self::DryRun),
            "configuration_error" => Ok(Self::ConfigurationError),
            "dependency_missing" => Ok(Self::DependencyMissing),
            _ => Err(format!("Invalid agent run status: {}", s)),
        }
    }
}

/// One `{kind, message}` error attached to an agent result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<&QuarryError> for ErrorRecord {
    fn from(err: &QuarryError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

/// Uniform result record produced by every agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub agent_id: String,
    pub model_id: String,
    pub status: AgentRunStatus,
    /// Opaque structured records; interpreted only by reporting collaborators
    #[serde(default)]
    pub findings: Vec<Value>,
    #[serde(default)]
    pub telemetry: Map<String, Value>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    #[serde(default)]
    pub retry_count: u32,
}

impl AgentRunResult {
    pub fn new(
        agent_id: impl Into<String>,
        model_id: impl Into<String>,
        status: AgentRunStatus,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            model_id: model_id.into(),
            status,
            findings: Vec::new(),
            telemetry: Map::new(),
            errors: Vec::new(),
            retry_count: 0,
        }
    }

    /// Synthetic result for an agent that exceeded its wall-clock ceiling
    pub fn timed_out(
        agent_id: impl Into<String>,
        model_id: impl Into<String>,
        after: Duration,
    ) -> Self {
        Self::new(agent_id, model_id, AgentRunStatus::Timeout).with_error(ErrorRecord::new(
            "timeout",
            format!("agent exceeded {}s ceiling", after.as_secs()),
        ))
    }

    /// Synthetic result for an error that survived the retry layer
    pub fn from_error(
        agent_id: impl Into<String>,
        model_id: impl Into<String>,
        err: &QuarryError,
    ) -> Self {
        Self::new(agent_id, model_id, AgentRunStatus::Failed).with_error(err.into())
    }

    pub fn dry_run(agent_id: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self::new(agent_id, model_id, AgentRunStatus::DryRun)
    }

    pub fn configuration_error(
        agent_id: impl Into<String>,
        model_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(agent_id, model_id, AgentRunStatus::ConfigurationError)
            .with_error(ErrorRecord::new("configuration_error", message))
    }

    pub fn dependency_missing(
        agent_id: impl Into<String>,
        model_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::new(agent_id, model_id, AgentRunStatus::DependencyMissing)
            .with_error(ErrorRecord::new("dependency_missing", message))
    }

    pub fn with_findings(mut self, findings: Vec<Value>) -> Self {
        self.findings = findings;
        self
    }

    pub fn with_telemetry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.telemetry.insert(key.into(), value.into());
        self
    }

    pub fn with_error(mut self, error: ErrorRecord) -> Self {
        self.errors.push(error);
        self
    }

    /// Items found: telemetry counter if the agent reported one, else the findings count
    pub fn items_found(&self) -> usize {
        ["items_found", "companies_found"]
            .iter()
            .find_map(|key| self.telemetry.get(*key).and_then(Value::as_u64))
            .map(|n| n as usize)
            .unwrap_or(self.findings.len())
    }

    /// Cost in USD reported through telemetry, zero when absent
    pub fn cost(&self) -> f64 {
        ["cost_usd", "cost"]
            .iter()
            .find_map(|key| self.telemetry.get(*key).and_then(Value::as_f64))
            .unwrap_or(0.0)
    }

    /// First error message, used for the registry's per-agent error string
    pub fn error_summary(&self) -> Option<String> {
        self.errors
            .first()
            .map(|e| format!("{}: {}", e.kind, e.message))
    }
}

/// Run-level lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Per-agent lifecycle status inside a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl ProviderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }

    fn stage(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Timeout => 2,
        }
    }

    /// Whether an agent in this state may move to `next`
    ///
    /// Terminal states accept nothing; otherwise the status may only move
    /// forward along `pending -> running -> terminal`.
    pub fn can_move_to(&self, next: ProviderState) -> bool {
        !self.is_terminal() && next.stage() >= self.stage()
    }
}

impl std::fmt::Display for ProviderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for ProviderState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timeout" => Ok(Self::Timeout),
            _ => Err(format!("Invalid provider status: {}", s)),
        }
    }
}

/// Registry view of one agent within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub status: ProviderState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items_found: usize,
    #[serde(default)]
    pub cost: f64,
    pub error: Option<String>,
}

impl ProviderStatus {
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ProviderState::Pending,
            started_at: None,
            completed_at: None,
            items_found: 0,
            cost: 0.0,
            error: None,
        }
    }
}

/// Pointer to the most recent event in a run's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPointer {
    pub seq: u64,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Current persisted state of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub project_id: String,
    pub config_ref: Option<String>,
    #[serde(default)]
    pub params: Map<String, Value>,
    pub status: RunStatus,
    pub phase: Option<String>,
    pub percent_complete: u8,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderStatus>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub report_path: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub total_cost: f64,
    pub last_event: Option<EventPointer>,
}

impl RunSnapshot {
    pub fn new(
        run_id: impl Into<RunId>,
        project_id: impl Into<String>,
        config_ref: Option<String>,
        params: Map<String, Value>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            project_id: project_id.into(),
            config_ref,
            params,
            status: RunStatus::Queued,
            phase: None,
            percent_complete: 0,
            providers: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            report_path: None,
            error: None,
            total_cost: 0.0,
            last_event: None,
        }
    }

    /// Move a queued run into `running`, stamping `started_at` once
    pub fn mark_started(&mut self) {
        if self.status == RunStatus::Queued {
            self.status = RunStatus::Running;
            self.started_at.get_or_insert_with(Utc::now);
        }
    }

    pub fn recompute_cost(&mut self) {
        self.total_cost = self.providers.values().map(|p| p.cost).sum();
    }

    /// Sort key for listings: most recently started first
    pub fn started_or_created(&self) -> DateTime<Utc> {
        self.started_at.unwrap_or(self.created_at)
    }
}

/// Well-known event type tags
pub mod event_types {
    pub const RUN_CREATED: &str = "run.created";
    pub const RUN_PHASE: &str = "run.phase";
    pub const RUN_COMPLETED: &str = "run.completed";
    pub const RUN_FAILED: &str = "run.failed";
    pub const PROVIDERS_REGISTERED: &str = "providers.registered";
    pub const PROVIDER_STATUS: &str = "provider.status";
    pub const AGENTS_NONE: &str = "agents.none";
}

/// Immutable record in a run's append-only history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl RunEvent {
    pub fn pointer(&self) -> EventPointer {
        EventPointer {
            seq: self.seq,
            event_type: self.event_type.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Opaque job payload handed to every agent of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobContext {
    pub project_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl JobContext {
    pub fn new(payload: Value) -> Self {
        Self {
            project_id: None,
            payload,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Top-level payload field, if the payload is an object
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AgentRunStatus::Partial.provider_state(),
            ProviderState::Completed
        );
        assert_eq!(
            AgentRunStatus::DryRun.provider_state(),
            ProviderState::Completed
        );
        assert_eq!(
            AgentRunStatus::DependencyMissing.provider_state(),
            ProviderState::Failed
        );
        assert_eq!(
            AgentRunStatus::Timeout.provider_state(),
            ProviderState::Timeout
        );
    }

    #[test]
    fn test_provider_state_moves_forward_only() {
        use ProviderState::*;
        assert!(Pending.can_move_to(Running));
        assert!(Pending.can_move_to(Failed));
        assert!(Running.can_move_to(Running));
        assert!(Running.can_move_to(Timeout));
        assert!(!Running.can_move_to(Pending));
        assert!(!Completed.can_move_to(Running));
        assert!(!Timeout.can_move_to(Completed));
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&AgentRunStatus::ConfigurationError).unwrap();
        assert_eq!(json, "\"configuration_error\"");
        let parsed: AgentRunStatus = "dry_run".parse().unwrap();
        assert_eq!(parsed, AgentRunStatus::DryRun);
    }

    #[test]
    fn test_items_found_prefers_telemetry() {
        let result = AgentRunResult::new("a", "m", AgentRunStatus::Completed)
            .with_findings(vec![json!({"name": "x"}), json!({"name": "y"})]);
        assert_eq!(result.items_found(), 2);

        let result = result.with_telemetry("companies_found", 7);
        assert_eq!(result.items_found(), 7);
    }

    #[test]
    fn test_cost_from_telemetry() {
        let result = AgentRunResult::new("a", "m", AgentRunStatus::Completed);
        assert_eq!(result.cost(), 0.0);

        let result = result.with_telemetry("cost_usd", 0.25);
        assert!((result.cost() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_from_error_record() {
        let err = QuarryError::Agent("backend exploded".into());
        let result = AgentRunResult::from_error("b", "m", &err);
        assert_eq!(result.status, AgentRunStatus::Failed);
        assert_eq!(result.errors[0].kind, "agent_error");
        assert!(result.error_summary().unwrap().contains("backend exploded"));
    }

    #[test]
    fn test_mark_started_only_from_queued() {
        let mut snapshot = RunSnapshot::new("r1", "wine-sector", None, Map::new());
        snapshot.mark_started();
        assert_eq!(snapshot.status, RunStatus::Running);
        let first = snapshot.started_at;

        snapshot.status = RunStatus::Completed;
        snapshot.mark_started();
        assert_eq!(snapshot.status, RunStatus::Completed);
        assert_eq!(snapshot.started_at, first);
    }
}
