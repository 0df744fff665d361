//! Tool handler trait

use async_trait::async_trait;
use quarry_core::Result;
use serde_json::Value;
use std::future::Future;

use crate::spec::ToolCall;

/// Backend that executes one tool
///
/// Handlers may be called concurrently by several agents. Transient failures
/// should surface as `Network`/`Timeout`/`ConnectionRefused` errors so the
/// manager retries them.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, call: &ToolCall) -> Result<Value>;

    /// Release held resources. Called once when the manager closes.
    async fn close(&self) {}
}

/// Adapter turning an async closure into a [`ToolHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a handler
///
/// ```no_run
/// use quarry_core::QuarryError;
/// use quarry_tools::{handler_fn, ToolCall};
/// use serde_json::json;
///
/// let handler = handler_fn(|call: ToolCall| async move {
///     Ok::<_, QuarryError>(json!({ "echo": call.kwargs }))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(ToolCall) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn call(&self, call: &ToolCall) -> Result<Value> {
        (self.f)(call.clone()).await
    }
}
