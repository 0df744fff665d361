//! Tool declarations and call arguments

use quarry_core::ToolConfig;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;

/// Static description of a callable tool. Immutable once registered.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub output_schema: Value,
    pub endpoint: Option<String>,
    /// Result cache lifetime; zero disables caching
    #[serde(with = "duration_secs")]
    pub cache_ttl: Duration,
    /// Hosts a `url` argument may point at; `None` means unrestricted
    pub allowed_domains: Option<BTreeSet<String>>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: json!({ "type": "object" }),
            output_schema: json!({}),
            endpoint: None,
            cache_ttl: Duration::ZERO,
            allowed_domains: None,
        }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        let mut spec = Self::new(&config.name)
            .with_description(&config.description)
            .with_endpoint(&config.endpoint)
            .with_cache_ttl(Duration::from_secs(config.cache_ttl_secs));
        if let Some(schema) = &config.input_schema {
            spec.input_schema = schema.clone();
        }
        if let Some(schema) = &config.output_schema {
            spec.output_schema = schema.clone();
        }
        if let Some(domains) = &config.allowed_domains {
            spec = spec.with_allowed_domains(domains.iter().cloned());
        }
        spec
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Restrict `url` arguments to these hosts (compared case-insensitively)
    pub fn with_allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains = Some(
            domains
                .into_iter()
                .map(|d| d.into().trim().to_lowercase())
                .collect(),
        );
        self
    }

    pub fn caching_enabled(&self) -> bool {
        !self.cache_ttl.is_zero()
    }
}

/// Positional and keyword arguments of one tool call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ToolCall {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl ToolCall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// The `url` argument: the keyword form, else a leading positional URL string
    pub fn url(&self) -> Option<&str> {
        if let Some(url) = self.kwargs.get("url") {
            return url.as_str();
        }
        self.args
            .first()
            .and_then(Value::as_str)
            .filter(|s| s.starts_with("http://") || s.starts_with("https://"))
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config() {
        let config = ToolConfig {
            name: "fetch_page".into(),
            description: "Fetch a page".into(),
            endpoint: "http://localhost:9000/fetch".into(),
            enabled: true,
            timeout_secs: 30,
            rate_limit_per_minute: None,
            allowed_domains: Some(vec!["Example.com".into()]),
            cache_ttl_secs: 300,
            input_schema: None,
            output_schema: None,
        };

        let spec = ToolSpec::from_config(&config);
        assert!(spec.caching_enabled());
        assert_eq!(spec.cache_ttl, Duration::from_secs(300));
        assert!(spec.allowed_domains.unwrap().contains("example.com"));
        assert_eq!(spec.endpoint.as_deref(), Some("http://localhost:9000/fetch"));
    }

    #[test]
    fn test_url_argument_lookup() {
        let call = ToolCall::new().kwarg("url", "https://example.com/x");
        assert_eq!(call.url(), Some("https://example.com/x"));

        let call = ToolCall::new().arg("https://example.com/a").arg(3);
        assert_eq!(call.url(), Some("https://example.com/a"));

        let call = ToolCall::new().arg("wine producers in Rioja");
        assert_eq!(call.url(), None);
    }
}
