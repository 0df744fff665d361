//! Declarative HTTP-backed tools
//!
//! Each call posts a `{name, args, kwargs}` envelope to the tool's endpoint.
//! HTTP error statuses come back as `{error, status_code, endpoint}` values so
//! the calling agent can decide whether to degrade; only transport failures
//! are raised, and those are classified transient for the retry layer.

use async_trait::async_trait;
use quarry_core::{QuarryError, Result, ToolConfig};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::handler::ToolHandler;
use crate::spec::ToolCall;

/// Evenly spaces requests to stay under a per-minute ceiling
#[derive(Debug)]
struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    fn per_minute(limit: u32) -> Option<Self> {
        if limit == 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs(60) / limit,
            next_slot: Mutex::new(Instant::now()),
        })
    }

    async fn acquire(&self) {
        let wait = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.interval;
            slot - now
        };
        if !wait.is_zero() {
            tracing::debug!("Rate limit: waiting {}ms", wait.as_millis());
            tokio::time::sleep(wait).await;
        }
    }
}

/// Tool handler posting to a configured HTTP endpoint
#[derive(Debug)]
pub struct HttpToolHandler {
    name: String,
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
    limiter: Option<RateLimiter>,
}

impl HttpToolHandler {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(30),
            client,
            limiter: None,
        }
    }

    pub fn from_config(config: &ToolConfig, client: reqwest::Client) -> Self {
        let mut handler = Self::new(&config.name, &config.endpoint, client)
            .with_timeout(Duration::from_secs(config.timeout_secs));
        if let Some(limit) = config.rate_limit_per_minute {
            handler = handler.with_rate_limit(limit);
        }
        handler
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.limiter = RateLimiter::per_minute(per_minute);
        self
    }

    fn error_value(&self, error: String, status_code: Option<u16>) -> Value {
        json!({
            "error": error,
            "status_code": status_code,
            "endpoint": self.endpoint,
        })
    }
}

#[async_trait]
impl ToolHandler for HttpToolHandler {
    async fn call(&self, call: &ToolCall) -> Result<Value> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let envelope = json!({
            "name": self.name,
            "args": call.args,
            "kwargs": call.kwargs,
        });

        tracing::debug!("POST {} for tool {}", self.endpoint, self.name);
        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&envelope)
            .send()
            .await
            .map_err(QuarryError::from)?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown".to_string());
            tracing::warn!(
                "Tool {} returned HTTP {}: {}",
                self.name,
                status.as_u16(),
                body
            );
            return Ok(self.error_value(format!("HTTP {}: {}", status, body), Some(status.as_u16())));
        }

        let body = response.text().await.map_err(QuarryError::from)?;
        match serde_json::from_str(&body) {
            Ok(value) => Ok(value),
            Err(e) => Ok(self.error_value(
                format!("invalid JSON response: {}", e),
                Some(status.as_u16()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// One-shot endpoint: answers a single request with `status` and `body`
    /// and yields the JSON body it received
    async fn endpoint(status: u16, body: &str) -> (String, tokio::task::JoinHandle<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/tools/web_search", listener.local_addr().unwrap());
        let reply = format!(
            "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let received = read_body(&mut socket).await;
            socket.write_all(reply.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            serde_json::from_str::<Value>(&received).unwrap()
        });
        (url, handle)
    }

    async fn read_body(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).into_owned();
            let Some(split) = text.find("\r\n\r\n") else {
                continue;
            };
            let length = text[..split]
                .lines()
                .filter_map(|l| l.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body = &buf[split + 4..];
            if body.len() >= length {
                return String::from_utf8_lossy(&body[..length]).into_owned();
            }
        }
        String::new()
    }

    #[tokio::test]
    async fn test_posts_call_envelope() {
        let (url, server) = endpoint(200, r#"{"results": [{"title": "Bodega A"}]}"#).await;
        let handler = HttpToolHandler::new("web_search", &url, reqwest::Client::new());

        let call = ToolCall::new().arg("rioja").kwarg("limit", 5);
        let value = handler.call(&call).await.unwrap();
        assert_eq!(value["results"][0]["title"], "Bodega A");

        let envelope = server.await.unwrap();
        assert_eq!(
            envelope,
            json!({"name": "web_search", "args": ["rioja"], "kwargs": {"limit": 5}})
        );
    }

    #[tokio::test]
    async fn test_error_status_becomes_error_value() {
        for status in [404u16, 503] {
            let (url, server) = endpoint(status, r#"{"detail": "nope"}"#).await;
            let handler = HttpToolHandler::new("web_search", &url, reqwest::Client::new());

            let value = handler.call(&ToolCall::new().kwarg("q", "x")).await.unwrap();
            assert_eq!(value["status_code"], status);
            assert_eq!(value["endpoint"], url.as_str());
            assert!(value["error"].as_str().unwrap().contains("nope"));
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_non_json_reply_becomes_error_value() {
        let (url, server) = endpoint(200, "<html>maintenance</html>").await;
        let handler = HttpToolHandler::new("web_search", &url, reqwest::Client::new());

        let value = handler.call(&ToolCall::new()).await.unwrap();
        assert!(value["error"].as_str().unwrap().contains("invalid JSON"));
        assert_eq!(value["status_code"], 200);
        server.await.unwrap();
    }

    #[test]
    fn test_from_config_applies_limits() {
        let config = ToolConfig {
            name: "web_search".into(),
            description: String::new(),
            endpoint: "http://localhost:8700/tools/web_search".into(),
            enabled: true,
            timeout_secs: 12,
            rate_limit_per_minute: Some(120),
            allowed_domains: None,
            cache_ttl_secs: 0,
            input_schema: None,
            output_schema: None,
        };

        let handler = HttpToolHandler::from_config(&config, reqwest::Client::new());
        assert_eq!(handler.timeout, Duration::from_secs(12));
        assert_eq!(
            handler.limiter.as_ref().map(|l| l.interval),
            Some(Duration::from_millis(500))
        );
    }

    #[test]
    fn test_zero_rate_limit_is_unlimited() {
        let handler =
            HttpToolHandler::new("t", "http://localhost:1", reqwest::Client::new()).with_rate_limit(0);
        assert!(handler.limiter.is_none());
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::per_minute(60_000).unwrap();
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(2));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let handler = HttpToolHandler::new("t", "http://127.0.0.1:9/tool", reqwest::Client::new())
            .with_timeout(Duration::from_secs(2));
        let err = handler.call(&ToolCall::new()).await.unwrap_err();
        assert!(err.is_transient(), "expected transient error, got {err:?}");
    }
}
