//! Tool manager: the single entry point for tool calls during a run
//!
//! Every invocation goes through the same pipeline: cache lookup, domain
//! policy, then the handler under the shared retry policy. A cache hit returns
//! before the policy check and never touches the handler. Replies carrying an
//! `error` field are returned but not cached.

use quarry_core::{with_retry, QuarryError, Result, RetryPolicy, ToolConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::cache::{cache_key, CacheStats, ToolCache};
use crate::handler::ToolHandler;
use crate::http::HttpToolHandler;
use crate::policy::check_domain;
use crate::spec::{ToolCall, ToolSpec};

struct RegisteredTool {
    spec: Arc<ToolSpec>,
    handler: Arc<dyn ToolHandler>,
}

/// Shared by all agents of a run
pub struct ToolManager {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    cache: ToolCache,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl ToolManager {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            cache: ToolCache::new(),
            retry,
            closed: AtomicBool::new(false),
        }
    }

    /// Register every enabled declared tool as an HTTP tool on `client`
    pub fn from_config(
        configs: &[ToolConfig],
        client: reqwest::Client,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let manager = Self::new(retry);
        for config in configs.iter().filter(|c| c.enabled) {
            let handler = HttpToolHandler::from_config(config, client.clone());
            manager.register(ToolSpec::from_config(config), handler)?;
        }
        tracing::info!("Registered {} tools", manager.len());
        Ok(manager)
    }

    /// Add a tool; names are unique per manager
    pub fn register(&self, spec: ToolSpec, handler: impl ToolHandler + 'static) -> Result<()> {
        self.register_arc(spec, Arc::new(handler))
    }

    pub fn register_arc(&self, spec: ToolSpec, handler: Arc<dyn ToolHandler>) -> Result<()> {
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&spec.name) {
            return Err(QuarryError::DuplicateTool(spec.name));
        }
        tracing::debug!("Registered tool {}", spec.name);
        tools.insert(
            spec.name.clone(),
            RegisteredTool {
                spec: Arc::new(spec),
                handler,
            },
        );
        Ok(())
    }

    /// Invoke `name` with `call`
    ///
    /// Domain policy violations fail on first occurrence. Handler errors in the
    /// transient set are retried under the manager's policy; anything else, or
    /// the last transient error once attempts run out, propagates.
    pub async fn invoke(&self, name: &str, call: ToolCall) -> Result<Value> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QuarryError::ToolManagerClosed);
        }

        let (spec, handler) = self.lookup(name)?;

        let key = spec.caching_enabled().then(|| cache_key(&spec.name, &call));
        if let Some(key) = &key {
            if let Some(value) = self.cache.get(key) {
                tracing::debug!("Cache hit for tool {}", name);
                return Ok(value);
            }
        }

        check_domain(&spec, &call)?;

        let outcome = with_retry(
            &format!("tool {}", name),
            &self.retry,
            QuarryError::is_transient,
            || handler.call(&call),
        )
        .await?;

        match key {
            Some(_) if is_error_value(&outcome.value) => {
                tracing::debug!("Not caching error reply from tool {}", name);
            }
            Some(key) => self.cache.insert(key, outcome.value.clone(), spec.cache_ttl),
            None => {}
        }
        Ok(outcome.value)
    }

    fn lookup(&self, name: &str) -> Result<(Arc<ToolSpec>, Arc<dyn ToolHandler>)> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        tools
            .get(name)
            .map(|t| (Arc::clone(&t.spec), Arc::clone(&t.handler)))
            .ok_or_else(|| QuarryError::ToolNotFound(name.to_string()))
    }

    /// Registered tool specs, sorted by name
    pub fn definitions(&self) -> Vec<Arc<ToolSpec>> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        let mut specs: Vec<_> = tools.values().map(|t| Arc::clone(&t.spec)).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close every handler. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers: Vec<Arc<dyn ToolHandler>> = {
            let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
            tools.values().map(|t| Arc::clone(&t.handler)).collect()
        };
        for handler in handlers {
            handler.close().await;
        }
        tracing::debug!("Tool manager closed");
    }
}

/// `{error, ...}` replies report a failed call and are never cached
fn is_error_value(value: &Value) -> bool {
    value.get("error").is_some_and(|e| !e.is_null())
}
