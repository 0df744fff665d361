//! Construct agents from configuration

use quarry_core::{AgentKind, QuarryConfig};
use quarry_tools::ToolManager;
use std::sync::Arc;

use crate::command::CommandAgentProvider;
use crate::http::HttpAgentProvider;
use crate::provider::{AgentProvider, AgentSettings, CredentialStore};
use crate::search::SearchAgentProvider;

/// Enabled agents in declaration order
///
/// `dry_run` is OR-ed with the config's own flag. The client and tool
/// manager are shared by every agent built here.
pub fn build_agents(
    config: &QuarryConfig,
    tools: Arc<ToolManager>,
    client: reqwest::Client,
    credentials: CredentialStore,
    dry_run: bool,
) -> Vec<Arc<dyn AgentProvider>> {
    let retry = config.retry.policy();
    let dry_run = dry_run || config.run.dry_run;

    config
        .active_agents()
        .map(|agent| {
            let settings = AgentSettings::from_config(agent, retry, dry_run);
            let provider: Arc<dyn AgentProvider> = match agent.kind {
                AgentKind::Http => Arc::new(HttpAgentProvider::new(
                    settings,
                    agent.endpoint.clone(),
                    client.clone(),
                    credentials.clone(),
                )),
                AgentKind::Command => Arc::new(CommandAgentProvider::new(
                    settings,
                    agent.command.clone(),
                    agent.args.clone(),
                    credentials.clone(),
                )),
                AgentKind::Search => Arc::new(SearchAgentProvider::new(
                    settings,
                    Arc::clone(&tools),
                    agent.tool.clone(),
                    credentials.clone(),
                )),
            };
            tracing::debug!("Built {} agent {}", agent.kind, agent.name);
            provider
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{AgentRunStatus, JobContext, RetryPolicy};

    #[tokio::test]
    async fn test_builds_enabled_agents_in_order() {
        let mut config = QuarryConfig::example();
        for agent in &mut config.agents {
            agent.enabled = true;
        }
        config.agents[0].enabled = false;
        let mut extra = config.agents[1].clone();
        extra.name = "cli-agent".into();
        extra.kind = AgentKind::Command;
        extra.command = Some("true".into());
        config.agents.push(extra);

        let agents = build_agents(
            &config,
            Arc::new(ToolManager::new(RetryPolicy::no_retry())),
            reqwest::Client::new(),
            CredentialStore::default(),
            true,
        );

        let names: Vec<&str> = agents.iter().map(|a| a.name()).collect();
        assert_eq!(names, vec!["web-scout", "cli-agent"]);

        for agent in &agents {
            let result = agent.run_with_retry(&JobContext::default()).await.unwrap();
            assert_eq!(result.status, AgentRunStatus::DryRun);
        }
    }
}
