//! Domain allow-list enforcement

use quarry_core::{QuarryError, Result};
use reqwest::Url;

use crate::spec::{ToolCall, ToolSpec};

/// Lowercased host of `url`, if it parses and has one
pub fn extract_host(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
}

/// Reject calls whose `url` argument points outside the tool's allow-list
///
/// Calls without a `url` argument, and tools without an allow-list, pass.
pub fn check_domain(spec: &ToolSpec, call: &ToolCall) -> Result<()> {
    let Some(allowed) = &spec.allowed_domains else {
        return Ok(());
    };
    let Some(url) = call.url() else {
        return Ok(());
    };

    match extract_host(url) {
        Some(host) if allowed.contains(&host) => Ok(()),
        Some(host) => Err(QuarryError::DomainNotAllowed {
            tool: spec.name.clone(),
            host,
        }),
        None => Err(QuarryError::DomainNotAllowed {
            tool: spec.name.clone(),
            host: url.to_string(),
        }),
    }
}
