//! Run execution: context loading, agent fan-out, aggregation

use quarry_agent::AgentProvider;
use quarry_core::fail_open::fail_open;
use quarry_core::{
    event_types, AgentRunResult, JobContext, QuarryError, Result, RunId, RunSettings,
    RunSnapshot,
};
use quarry_registry::{ProviderUpdate, RunRegistry};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::context::ContextLoader;

pub const PHASE_LOADING_CONTEXT: &str = "loading_context";
pub const PHASE_RUNNING_AGENTS: &str = "running_agents";
pub const PHASE_AGGREGATING: &str = "aggregating";

// Progress reserved before and after the agent fan-out
const AGENTS_START_PERCENT: usize = 10;
const AGENTS_SPAN_PERCENT: usize = 80;

/// Configuration for an orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Hard wall-clock ceiling per agent, unless the agent sets its own
    pub agent_timeout: Duration,
}

impl OrchestratorConfig {
    pub fn new(agent_timeout: Duration) -> Self {
        Self { agent_timeout }
    }

    pub fn from_settings(settings: &RunSettings) -> Self {
        Self::new(settings.agent_timeout())
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_settings(&RunSettings::default())
    }
}

/// What to run
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub project_id: String,
    pub config_ref: Option<String>,
    pub params: Map<String, Value>,
    pub run_id: Option<RunId>,
    /// Where the aggregated results are written; recorded as the run's report
    pub report_path: Option<PathBuf>,
}

impl RunRequest {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            config_ref: None,
            params: Map::new(),
            run_id: None,
            report_path: None,
        }
    }

    pub fn with_config_ref(mut self, config_ref: impl Into<String>) -> Self {
        self.config_ref = Some(config_ref.into());
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<RunId>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_report_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_path = Some(path.into());
        self
    }
}

/// Final snapshot plus agent results in schedule order
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub snapshot: RunSnapshot,
    pub results: Vec<AgentRunResult>,
}

/// Runs agents concurrently and records progress in the registry
pub struct Orchestrator {
    registry: Arc<RunRegistry>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(registry: Arc<RunRegistry>, config: OrchestratorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Execute one run end to end
    ///
    /// Individual agent failures never fail the run. The run is marked
    /// `failed`, and the error returned, only for faults outside the fan-out:
    /// an unloadable job context, an unwritable report, or a registry that
    /// cannot record completion. Once the run exists it always ends terminal
    /// unless the registry itself is unwritable.
    pub async fn execute(
        &self,
        request: RunRequest,
        loader: &dyn ContextLoader,
        agents: &[Arc<dyn AgentProvider>],
    ) -> Result<RunOutcome> {
        let snapshot = self
            .registry
            .create_run(
                &request.project_id,
                request.config_ref.clone(),
                request.params.clone(),
                request.run_id.clone(),
            )
            .await?;
        let run_id = snapshot.run_id;
        info!("Starting run {} with {} agents", run_id, agents.len());

        match self.drive(&run_id, &request, loader, agents).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.fail_run(&run_id, e).await),
        }
    }

    /// Everything after run creation; any error here fails the run
    async fn drive(
        &self,
        run_id: &str,
        request: &RunRequest,
        loader: &dyn ContextLoader,
        agents: &[Arc<dyn AgentProvider>],
    ) -> Result<RunOutcome> {
        self.progress(run_id, PHASE_LOADING_CONTEXT, 5).await;
        let context = loader.load(&request.project_id).await?;

        self.progress(run_id, PHASE_RUNNING_AGENTS, AGENTS_START_PERCENT)
            .await;
        let results = self.run_agents(run_id, &context, agents).await;

        self.progress(
            run_id,
            PHASE_AGGREGATING,
            AGENTS_START_PERCENT + AGENTS_SPAN_PERCENT,
        )
        .await;

        let report_path = match &request.report_path {
            Some(path) => {
                write_report(path, run_id, &results).await?;
                Some(path.display().to_string())
            }
            None => None,
        };

        let snapshot = self.registry.complete_run(run_id, report_path, None).await?;
        info!(
            "Run {} completed: {} agents, total cost ${:.4}",
            run_id,
            results.len(),
            snapshot.total_cost
        );

        Ok(RunOutcome { snapshot, results })
    }

    /// Best-effort phase marker; a failed write never stops the run
    async fn progress(&self, run_id: &str, phase: &str, percent: usize) {
        fail_open("orchestrator::mark_phase", || {
            self.registry.mark_phase(run_id, phase, percent as u8)
        })
        .await;
    }

    async fn fail_run(&self, run_id: &str, err: QuarryError) -> QuarryError {
        error!("Run {} failed: {}", run_id, err);
        fail_open("orchestrator::complete_run", || {
            self.registry
                .complete_run(run_id, None, Some(err.to_string()))
        })
        .await;
        err
    }

    /// Run every agent concurrently under the hard timeout
    ///
    /// Always yields one result per agent, in the order given, whatever each
    /// agent did: errors, panics and timeouts become synthetic results. Each
    /// agent's registry entry is updated as soon as it finishes.
    pub async fn run_agents(
        &self,
        run_id: &str,
        context: &JobContext,
        agents: &[Arc<dyn AgentProvider>],
    ) -> Vec<AgentRunResult> {
        if agents.is_empty() {
            warn!("Run {} has no active agents", run_id);
            fail_open("orchestrator::agents_none", || {
                self.registry.append_event(
                    run_id,
                    event_types::AGENTS_NONE,
                    json!({ "message": "no active agents" }),
                )
            })
            .await;
            return Vec::new();
        }

        let names: Vec<String> = agents.iter().map(|a| a.name().to_string()).collect();
        fail_open("orchestrator::register_providers", || {
            self.registry.register_providers(run_id, &names)
        })
        .await;

        let context = Arc::new(context.clone());
        let finished = Arc::new(AtomicUsize::new(0));
        let total = agents.len();

        let handles: Vec<_> = agents
            .iter()
            .map(|agent| {
                let task = AgentTask {
                    registry: Arc::clone(&self.registry),
                    run_id: run_id.to_string(),
                    agent: Arc::clone(agent),
                    context: Arc::clone(&context),
                    timeout: agent.settings().timeout.unwrap_or(self.config.agent_timeout),
                    finished: Arc::clone(&finished),
                    total,
                };
                tokio::spawn(task.run())
            })
            .collect();

        let mut results = Vec::with_capacity(total);
        for (agent, handle) in agents.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_error) => {
                    let settings = agent.settings();
                    error!("Agent {} task aborted: {}", settings.name, join_error);
                    let err = QuarryError::Agent(format!("agent task aborted: {}", join_error));
                    let result = AgentRunResult::from_error(&settings.name, &settings.model, &err);
                    fail_open("orchestrator::record_aborted", || {
                        self.registry.set_provider_status(
                            run_id,
                            &settings.name,
                            ProviderUpdate::from_result(&result),
                        )
                    })
                    .await;
                    result
                }
            };
            results.push(result);
        }
        results
    }
}

/// One agent's execution inside the fan-out
struct AgentTask {
    registry: Arc<RunRegistry>,
    run_id: RunId,
    agent: Arc<dyn AgentProvider>,
    context: Arc<JobContext>,
    timeout: Duration,
    finished: Arc<AtomicUsize>,
    total: usize,
}

impl AgentTask {
    async fn run(self) -> AgentRunResult {
        let settings = self.agent.settings();
        let name = settings.name.as_str();
        let model = settings.model.as_str();

        fail_open("orchestrator::mark_running", || {
            self.registry
                .set_provider_status(&self.run_id, name, ProviderUpdate::running())
        })
        .await;

        debug!("Agent {} started (timeout {}s)", name, self.timeout.as_secs());
        let result =
            match tokio::time::timeout(self.timeout, self.agent.run_with_retry(&self.context))
                .await
            {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => {
                    warn!("Agent {} failed: {}", name, e);
                    AgentRunResult::from_error(name, model, &e)
                }
                Err(_) => {
                    warn!(
                        "Agent {} exceeded {}s ceiling",
                        name,
                        self.timeout.as_secs()
                    );
                    AgentRunResult::timed_out(name, model, self.timeout)
                }
            };

        fail_open("orchestrator::record_result", || {
            self.registry.set_provider_status(
                &self.run_id,
                name,
                ProviderUpdate::from_result(&result),
            )
        })
        .await;

        // Completions may land out of order; the registry keeps the maximum
        let done = self.finished.fetch_add(1, Ordering::SeqCst) + 1;
        let percent = AGENTS_START_PERCENT + AGENTS_SPAN_PERCENT * done / self.total;
        fail_open("orchestrator::progress", || {
            self.registry
                .mark_phase(&self.run_id, PHASE_RUNNING_AGENTS, percent as u8)
        })
        .await;

        info!(
            "Agent {} finished: {} ({} items, {} retries)",
            name,
            result.status,
            result.items_found(),
            result.retry_count
        );
        result
    }
}

async fn write_report(path: &Path, run_id: &str, results: &[AgentRunResult]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir).await?;
    }
    let report = json!({
        "run_id": run_id,
        "results": results,
    });
    tokio::fs::write(path, serde_json::to_vec_pretty(&report)?).await?;
    debug!("Wrote results for run {} to {}", run_id, path.display());
    Ok(())
}
