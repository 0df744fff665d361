//! Configuration management for Quarry
//!
//! Loaded from `.quarry/config.toml` in the project root. Holds run defaults,
//! the retry policy, tool declarations, agent declarations and configured secrets.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::{RetryPolicy, MAX_ATTEMPTS};
use crate::{QuarryError, Result};

/// Relative location of the config file inside a project root
pub const CONFIG_PATH: &str = ".quarry/config.toml";

/// Project-level Quarry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuarryConfig {
    /// Run execution defaults
    #[serde(default)]
    pub run: RunSettings,

    /// Retry policy shared by the tool and agent layers
    #[serde(default)]
    pub retry: RetryConfig,

    /// Declared tools
    #[serde(default)]
    pub tools: Vec<ToolConfig>,

    /// Declared agents, in scheduling order
    #[serde(default)]
    pub agents: Vec<AgentConfig>,

    /// Secrets consulted before the process environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, String>,
}

/// Run execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Hard wall-clock ceiling per agent
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Directory holding run snapshots and event logs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Skip external calls and return `dry_run` results
    #[serde(default)]
    pub dry_run: bool,

    /// Project id used when a job does not name one
    #[serde(default = "default_project")]
    pub default_project: String,
}

/// Retry policy in config units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// Declaration of one callable tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// HTTP endpoint receiving the `{name, args, kwargs}` envelope
    pub endpoint: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum requests per minute (unlimited when absent)
    #[serde(default)]
    pub rate_limit_per_minute: Option<u32>,

    /// Hosts a `url` argument may point at (unrestricted when absent)
    #[serde(default)]
    pub allowed_domains: Option<Vec<String>>,

    /// Result cache lifetime; 0 disables caching
    #[serde(default)]
    pub cache_ttl_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

/// Backend family of a declared agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Remote agent service reached over HTTP
    #[default]
    Http,
    /// External agent executable speaking JSON over stdio
    Command,
    /// Built-in agent driving a search tool through the tool manager
    Search,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Command => write!(f, "command"),
            Self::Search => write!(f, "search"),
        }
    }
}

/// Declaration of one research agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,

    #[serde(default)]
    pub kind: AgentKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,

    /// Attempt cap for this agent; can only lower the global retry policy
    #[serde(default = "default_max_attempts")]
    pub retry_limit: u32,

    /// Name of the secret or environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,

    /// Per-agent override of the run's hard timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Backend endpoint (`http` agents)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Executable (`command` agents)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Tool driven by `search` agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
}

// Default value providers
fn default_agent_timeout_secs() -> u64 {
    90 * 60
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".quarry/runs")
}

fn default_project() -> String {
    "default".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_enabled() -> bool {
    true
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_model() -> String {
    "default".to_string()
}

impl QuarryConfig {
    /// Load configuration from `.quarry/config.toml` or use defaults
    pub fn load_or_default(project_root: &Path) -> Result<Self> {
        let config_path = project_root.join(CONFIG_PATH);

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::debug!("No config file at {}, using defaults", config_path.display());
            Ok(Self::default())
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            QuarryError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Write the example configuration to `.quarry/config.toml`
    pub fn write_default(project_root: &Path) -> Result<PathBuf> {
        let config_path = project_root.join(CONFIG_PATH);
        if let Some(dir) = config_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(&Self::example())
            .map_err(|e| QuarryError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    /// Example configuration with one disabled tool and agent of each kind
    pub fn example() -> Self {
        Self {
            tools: vec![ToolConfig {
                name: "web_search".to_string(),
                description: "Search the web and return ranked results".to_string(),
                endpoint: "http://localhost:8700/tools/web_search".to_string(),
                enabled: false,
                timeout_secs: default_tool_timeout_secs(),
                rate_limit_per_minute: Some(60),
                allowed_domains: None,
                cache_ttl_secs: 3600,
                input_schema: None,
                output_schema: None,
            }],
            agents: vec![
                AgentConfig {
                    name: "remote-researcher".to_string(),
                    kind: AgentKind::Http,
                    enabled: false,
                    model: "research-large".to_string(),
                    temperature: Some(0.2),
                    max_steps: Some(40),
                    retry_limit: default_max_attempts(),
                    credential: Some("RESEARCH_AGENT_API_KEY".to_string()),
                    timeout_secs: None,
                    endpoint: Some("http://localhost:8800/v1/research".to_string()),
                    command: None,
                    args: Vec::new(),
                    tool: None,
                },
                AgentConfig {
                    name: "web-scout".to_string(),
                    kind: AgentKind::Search,
                    enabled: false,
                    model: "none".to_string(),
                    temperature: None,
                    max_steps: Some(10),
                    retry_limit: default_max_attempts(),
                    credential: None,
                    timeout_secs: None,
                    endpoint: None,
                    command: None,
                    args: Vec::new(),
                    tool: Some("web_search".to_string()),
                },
            ],
            ..Self::default()
        }
    }

    /// Reject duplicate tool or agent names
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name.as_str()) {
                return Err(QuarryError::Config(format!(
                    "duplicate tool name: {}",
                    tool.name
                )));
            }
        }

        seen.clear();
        for agent in &self.agents {
            if !seen.insert(agent.name.as_str()) {
                return Err(QuarryError::Config(format!(
                    "duplicate agent name: {}",
                    agent.name
                )));
            }
        }
        Ok(())
    }

    /// Enabled agents in declaration order
    pub fn active_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }
}

impl RunSettings {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }
}

impl RetryConfig {
    /// Runtime policy; attempts above the hard ceiling are clamped to it
    pub fn policy(&self) -> RetryPolicy {
        if self.max_attempts > MAX_ATTEMPTS {
            tracing::warn!(
                "retry.max_attempts = {} exceeds the limit of {}; using {}",
                self.max_attempts,
                MAX_ATTEMPTS,
                MAX_ATTEMPTS
            );
        }
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            agent_timeout_secs: default_agent_timeout_secs(),
            state_dir: default_state_dir(),
            dry_run: false,
            default_project: default_project(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}
