//! Agent backed by an external executable
//!
//! The job request is written to the child's stdin as JSON and the result
//! document is read from its stdout. The child is killed if the run is
//! abandoned (for example when the orchestrator's timeout fires).

use async_trait::async_trait;
use quarry_core::{AgentRunResult, AgentRunStatus, ErrorRecord, JobContext, Result};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::provider::{parse_output, AgentProvider, AgentSettings, CredentialStore};

/// Environment variable carrying the resolved credential to the child
pub const CREDENTIAL_ENV: &str = "QUARRY_AGENT_CREDENTIAL";

pub struct CommandAgentProvider {
    settings: AgentSettings,
    command: Option<String>,
    args: Vec<String>,
    credentials: CredentialStore,
}

impl CommandAgentProvider {
    pub fn new(
        settings: AgentSettings,
        command: Option<String>,
        args: Vec<String>,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            settings,
            command,
            args,
            credentials,
        }
    }
}

#[async_trait]
impl AgentProvider for CommandAgentProvider {
    fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    async fn run(&self, context: &JobContext) -> Result<AgentRunResult> {
        let settings = &self.settings;
        let Some(program) = &self.command else {
            return Ok(AgentRunResult::configuration_error(
                &settings.name,
                &settings.model,
                "no command configured",
            ));
        };

        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(credential) = &settings.credential {
            match self.resolve_credential(credential) {
                Some(token) => {
                    cmd.env(CREDENTIAL_ENV, token);
                }
                None => {
                    return Ok(AgentRunResult::configuration_error(
                        &settings.name,
                        &settings.model,
                        format!("credential {} is not set", credential),
                    ));
                }
            }
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Agent {}: {} not found", settings.name, program);
                return Ok(AgentRunResult::dependency_missing(
                    &settings.name,
                    &settings.model,
                    format!("executable {} not found", program),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        let input = serde_json::to_vec(&settings.request_body(context))?;
        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // The child may exit without reading its input
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!("Agent stdin closed early: {}", e);
                }
            })
        });

        tracing::info!("Running agent {} via {}", settings.name, program);
        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            writer.await.ok();
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Ok(
                AgentRunResult::new(&settings.name, &settings.model, AgentRunStatus::Failed)
                    .with_error(ErrorRecord::new(
                        "command_failed",
                        format!("{} exited with {}: {}", program, output.status, stderr.trim()),
                    )),
            );
        }

        parse_output(settings, &String::from_utf8_lossy(&output.stdout))
    }
}
