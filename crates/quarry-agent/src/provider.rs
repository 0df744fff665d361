//! Agent provider contract
//!
//! A backend implements [`AgentProvider::run`]. Soft failures (missing
//! credential, missing runtime) come back as results with the matching status;
//! only errors meant for the retry layer, or genuinely unexpected ones, are
//! returned as `Err`. Retry, dry-run and credential lookup are provided here
//! so backends do not repeat them.

use async_trait::async_trait;
use quarry_core::{
    with_retry, AgentConfig, AgentRunResult, AgentRunStatus, ErrorRecord, JobContext,
    QuarryError, Result, RetryPolicy,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

/// Per-agent settings shared by every backend
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub name: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_steps: Option<u32>,
    pub retry: RetryPolicy,
    /// Secret or environment variable holding the backend credential
    pub credential: Option<String>,
    /// Overrides the run's hard timeout for this agent
    pub timeout: Option<Duration>,
    pub dry_run: bool,
}

impl AgentSettings {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            temperature: None,
            max_steps: None,
            retry: RetryPolicy::default(),
            credential: None,
            timeout: None,
            dry_run: false,
        }
    }

    /// Settings for a declared agent; `retry_limit` can only lower `retry`
    pub fn from_config(config: &AgentConfig, retry: RetryPolicy, dry_run: bool) -> Self {
        Self {
            name: config.name.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_steps: config.max_steps,
            retry: retry.capped(config.retry_limit),
            credential: config.credential.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
            dry_run,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Request body describing this agent and the job
    pub(crate) fn request_body(&self, context: &JobContext) -> Value {
        json!({
            "agent": self.name,
            "model": self.model,
            "temperature": self.temperature,
            "max_steps": self.max_steps,
            "project_id": context.project_id,
            "context": context.payload,
        })
    }
}

/// Credential lookup: configured secrets first, then the process environment
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    secrets: Arc<BTreeMap<String, String>>,
}

impl CredentialStore {
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        Self {
            secrets: Arc::new(secrets),
        }
    }

    pub fn resolve(&self, name: &str) -> Option<String> {
        if let Some(secret) = self.secrets.get(name) {
            tracing::debug!("Using configured secret {}", name);
            return Some(secret.clone());
        }
        env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// Uniform contract over external agent backends
#[async_trait]
pub trait AgentProvider: Send + Sync {
    fn settings(&self) -> &AgentSettings;

    fn credentials(&self) -> &CredentialStore;

    fn name(&self) -> &str {
        &self.settings().name
    }

    /// One attempt against the backend
    async fn run(&self, context: &JobContext) -> Result<AgentRunResult>;

    /// [`run`](Self::run) under the agent's retry policy
    ///
    /// Only transient errors are retried. The returned result carries the
    /// number of retries this call performed. In dry-run mode no backend call
    /// is made.
    async fn run_with_retry(&self, context: &JobContext) -> Result<AgentRunResult> {
        let settings = self.settings();
        if settings.dry_run {
            tracing::info!("Dry run: skipping agent {}", settings.name);
            return Ok(AgentRunResult::dry_run(&settings.name, &settings.model));
        }

        let outcome = with_retry(
            &format!("agent {}", settings.name),
            &settings.retry,
            QuarryError::is_transient,
            || self.run(context),
        )
        .await?;

        let retries = outcome.retries();
        let mut result = outcome.value;
        result.retry_count = retries;
        Ok(result)
    }

    /// Configured secret `name`, else the environment variable of that name
    fn resolve_credential(&self, name: &str) -> Option<String> {
        self.credentials().resolve(name)
    }
}

/// Result document returned by HTTP and command backends
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct AgentOutput {
    pub status: Option<AgentRunStatus>,
    pub findings: Vec<Value>,
    pub telemetry: Map<String, Value>,
    pub errors: Vec<ErrorRecord>,
}

impl AgentOutput {
    /// Parse a backend's JSON output into a result for `settings`
    pub fn into_result(self, settings: &AgentSettings) -> AgentRunResult {
        let status = self.status.unwrap_or(if self.errors.is_empty() {
            AgentRunStatus::Completed
        } else {
            AgentRunStatus::Partial
        });

        let mut result = AgentRunResult::new(&settings.name, &settings.model, status)
            .with_findings(self.findings);
        result.telemetry = self.telemetry;
        result.errors = self.errors;
        result
    }
}

pub(crate) fn parse_output(settings: &AgentSettings, body: &str) -> Result<AgentRunResult> {
    let output: AgentOutput = serde_json::from_str(body).map_err(|e| {
        QuarryError::Agent(format!(
            "agent {} returned an unreadable result: {}",
            settings.name, e
        ))
    })?;
    Ok(output.into_result(settings))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    // Mutex to prevent concurrent env var modifications
    pub(crate) static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn with_env_vars<F, R>(vars: &[(&str, Option<&str>)], f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());

        let originals: Vec<_> = vars.iter().map(|(k, _)| (*k, env::var(k).ok())).collect();
        for (key, value) in vars {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }

        let result = f();

        for (key, original) in originals {
            match original {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
        result
    }

    pub(crate) fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    /// Backend failing its first `failures` attempts with `error`
    struct Scripted {
        settings: AgentSettings,
        credentials: CredentialStore,
        calls: AtomicU32,
        failures: u32,
        error: fn() -> QuarryError,
    }

    impl Scripted {
        fn new(failures: u32, error: fn() -> QuarryError) -> Self {
            Self {
                settings: AgentSettings::new("scripted", "m1").with_retry(fast_retry()),
                credentials: CredentialStore::default(),
                calls: AtomicU32::new(0),
                failures,
                error,
            }
        }
    }

    #[async_trait]
    impl AgentProvider for Scripted {
        fn settings(&self) -> &AgentSettings {
            &self.settings
        }

        fn credentials(&self) -> &CredentialStore {
            &self.credentials
        }

        async fn run(&self, _context: &JobContext) -> Result<AgentRunResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err((self.error)());
            }
            Ok(AgentRunResult::new("scripted", "m1", AgentRunStatus::Completed))
        }
    }

    #[tokio::test]
    async fn test_run_with_retry_counts_retries() {
        let agent = Scripted::new(2, || QuarryError::Network("reset".into()));
        let result = agent.run_with_retry(&JobContext::default()).await.unwrap();
        assert_eq!(result.status, AgentRunStatus::Completed);
        assert_eq!(result.retry_count, 2);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);

        // The counter belongs to one call
        let again = agent.run_with_retry(&JobContext::default()).await.unwrap();
        assert_eq!(again.retry_count, 0);
    }

    #[tokio::test]
    async fn test_run_with_retry_gives_up() {
        let agent = Scripted::new(u32::MAX, || QuarryError::Timeout("slow".into()));
        let result = agent.run_with_retry(&JobContext::default()).await;
        assert!(matches!(result, Err(QuarryError::Timeout(_))));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_not_retried() {
        let agent = Scripted::new(u32::MAX, || QuarryError::Agent("bad prompt".into()));
        let result = agent.run_with_retry(&JobContext::default()).await;
        assert!(matches!(result, Err(QuarryError::Agent(_))));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_backend() {
        let mut agent = Scripted::new(0, || QuarryError::Other("unused".into()));
        agent.settings.dry_run = true;
        let result = agent.run_with_retry(&JobContext::default()).await.unwrap();
        assert_eq!(result.status, AgentRunStatus::DryRun);
        assert_eq!(agent.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_credentials_prefer_secrets() {
        let mut secrets = BTreeMap::new();
        secrets.insert("QUARRY_TEST_KEY".to_string(), "from-config".to_string());
        let store = CredentialStore::new(secrets);

        with_env_vars(&[("QUARRY_TEST_KEY", Some("from-env"))], || {
            assert_eq!(store.resolve("QUARRY_TEST_KEY").as_deref(), Some("from-config"));
        });
    }

    #[test]
    fn test_credentials_fall_back_to_env() {
        let store = CredentialStore::default();
        with_env_vars(&[("QUARRY_TEST_ENV_ONLY", Some("from-env"))], || {
            assert_eq!(store.resolve("QUARRY_TEST_ENV_ONLY").as_deref(), Some("from-env"));
        });
        with_env_vars(&[("QUARRY_TEST_ENV_ONLY", None)], || {
            assert_eq!(store.resolve("QUARRY_TEST_ENV_ONLY"), None);
        });
    }

    #[test]
    fn test_settings_from_config_caps_retries() {
        let mut config = quarry_core::QuarryConfig::example().agents[0].clone();
        config.retry_limit = 1;
        config.timeout_secs = Some(60);

        let settings = AgentSettings::from_config(&config, RetryPolicy::default(), true);
        assert_eq!(settings.retry.max_attempts, 1);
        assert_eq!(settings.timeout, Some(Duration::from_secs(60)));
        assert!(settings.dry_run);
        assert_eq!(settings.model, "research-large");
    }

    #[test]
    fn test_parse_output_defaults() {
        let settings = AgentSettings::new("a", "m");
        let result = parse_output(&settings, r#"{"findings": [{"name": "x"}]}"#).unwrap();
        assert_eq!(result.status, AgentRunStatus::Completed);
        assert_eq!(result.items_found(), 1);

        let result = parse_output(
            &settings,
            r#"{"errors": [{"kind": "tool_error", "message": "rate limited"}]}"#,
        )
        .unwrap();
        assert_eq!(result.status, AgentRunStatus::Partial);

        assert!(parse_output(&settings, "not json").is_err());
    }
}
