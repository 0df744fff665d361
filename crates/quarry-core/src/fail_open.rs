//! Fail-open helper for best-effort bookkeeping
//!
//! Registry pointer updates and progress events must never abort an agent run
//! or the aggregation loop. Such operations go through [`fail_open`], which logs
//! the failure and yields `None`.
//!
//! Not for agent execution or tool invocation: those failures carry meaning and
//! are converted into result records instead.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Await `f`, turning any error into a `warn!` and `None`
///
/// The operation runs exactly once; callers that want retries wrap the inner
/// future in [`crate::retry::with_retry`] themselves.
///
/// ```no_run
/// use quarry_core::fail_open::fail_open;
/// use quarry_core::Result;
///
/// async fn write_phase(run_id: &str, percent: u8) -> Result<u8> {
///     Ok(percent)
/// }
///
/// async fn example(run_id: &str) {
///     if fail_open("mark_phase", || write_phase(run_id, 40)).await.is_none() {
///         // progress for this phase was not recorded; the run carries on
///     }
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
