//! Built-in agent driving a search tool
//!
//! Issues one tool call per query in `context.queries`, one at a time,
//! through the run's shared [`ToolManager`]. Failed queries are recorded and
//! degrade the run to `partial`; the run is `failed` only if every query failed.

use async_trait::async_trait;
use quarry_core::{AgentRunResult, AgentRunStatus, ErrorRecord, JobContext, Result};
use quarry_tools::{ToolCall, ToolManager};
use serde_json::Value;
use std::sync::Arc;

use crate::provider::{AgentProvider, AgentSettings, CredentialStore};

pub struct SearchAgentProvider {
    settings: AgentSettings,
    tools: Arc<ToolManager>,
    tool: Option<String>,
    credentials: CredentialStore,
}

impl SearchAgentProvider {
    pub fn new(
        settings: AgentSettings,
        tools: Arc<ToolManager>,
        tool: Option<String>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            settings,
            tools,
            tool,
            credentials,
        }
    }
}

/// Queries from `queries` (array of strings) or a single `query` string
fn queries(context: &JobContext) -> Vec<String> {
    match context.get("queries") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => context
            .get("query")
            .and_then(Value::as_str)
            .map(|q| vec![q.to_string()])
            .unwrap_or_default(),
    }
}

/// Message of an `{error, ...}` tool response
fn tool_error(value: &Value) -> Option<String> {
    let error = value.get("error").filter(|e| !e.is_null())?;
    Some(
        error
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
    )
}

/// Findings carried by one tool response
fn findings_from(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("results") {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => vec![Value::Object(map)],
        },
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

#[async_trait]
impl AgentProvider for SearchAgentProvider {
    fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    async fn run(&self, context: &JobContext) -> Result<AgentRunResult> {
        let settings = &self.settings;
        let tool = match &self.tool {
            Some(tool) if self.tools.contains(tool) => tool,
            Some(tool) => {
                return Ok(AgentRunResult::configuration_error(
                    &settings.name,
                    &settings.model,
                    format!("tool {} is not registered", tool),
                ))
            }
            None => {
                return Ok(AgentRunResult::configuration_error(
                    &settings.name,
                    &settings.model,
                    "no tool configured",
                ))
            }
        };

        let mut queries = queries(context);
        if queries.is_empty() {
            return Ok(AgentRunResult::configuration_error(
                &settings.name,
                &settings.model,
                "job context has no queries",
            ));
        }
        if let Some(max_steps) = settings.max_steps {
            queries.truncate(max_steps as usize);
        }

        let mut findings = Vec::new();
        let mut errors = Vec::new();
        for query in &queries {
            let call = ToolCall::new().kwarg("query", query.as_str());
            match self.tools.invoke(tool, call).await {
                Ok(value) => match tool_error(&value) {
                    Some(message) => {
                        errors.push(ErrorRecord::new(
                            "tool_error",
                            format!("{}: {}", query, message),
                        ));
                    }
                    None => findings.extend(findings_from(value)),
                },
                Err(e) => {
                    tracing::warn!("Agent {}: query {:?} failed: {}", settings.name, query, e);
                    errors.push(ErrorRecord::new(e.kind(), format!("{}: {}", query, e)));
                }
            }
        }

        let status = if errors.is_empty() {
            AgentRunStatus::Completed
        } else if errors.len() == queries.len() {
            AgentRunStatus::Failed
        } else {
            AgentRunStatus::Partial
        };

        let mut result = AgentRunResult::new(&settings.name, &settings.model, status)
            .with_telemetry("queries", queries.len())
            .with_telemetry("queries_failed", errors.len())
            .with_telemetry("items_found", findings.len())
            .with_findings(findings);
        result.errors = errors;
        Ok(result)
    }
}
