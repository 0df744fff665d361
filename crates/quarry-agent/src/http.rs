//! Remote agent reached over HTTP

use async_trait::async_trait;
use quarry_core::{AgentRunResult, AgentRunStatus, ErrorRecord, JobContext, QuarryError, Result};

use crate::provider::{parse_output, AgentProvider, AgentSettings, CredentialStore};

/// Agent backend that posts the job to a remote research service
///
/// The service answers with `{status?, findings, telemetry, errors}`.
/// 408, 429 and 5xx answers are treated as transient and retried; other
/// error statuses end the run as `failed`.
pub struct HttpAgentProvider {
    settings: AgentSettings,
    endpoint: Option<String>,
    client: reqwest::Client,
    credentials: CredentialStore,
}

impl HttpAgentProvider {
    pub fn new(
        settings: AgentSettings,
        endpoint: Option<String>,
        client: reqwest::Client,
        credentials: CredentialStore,
    ) -> Self {
        Self {
            settings,
            endpoint,
            client,
            credentials,
        }
    }
}

#[async_trait]
impl AgentProvider for HttpAgentProvider {
    fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    async fn run(&self, context: &JobContext) -> Result<AgentRunResult> {
        let settings = &self.settings;
        let Some(endpoint) = &self.endpoint else {
            return Ok(AgentRunResult::configuration_error(
                &settings.name,
                &settings.model,
                "no endpoint configured",
            ));
        };

        let token = match &settings.credential {
            Some(credential) => match self.resolve_credential(credential) {
                Some(token) => Some(token),
                None => {
                    tracing::warn!(
                        "Agent {}: credential {} is not set",
                        settings.name,
                        credential
                    );
                    return Ok(AgentRunResult::configuration_error(
                        &settings.name,
                        &settings.model,
                        format!("credential {} is not set", credential),
                    ));
                }
            },
            None => None,
        };

        tracing::info!("Running agent {} against {}", settings.name, endpoint);
        let mut request = self
            .client
            .post(endpoint)
            .json(&settings.request_body(context));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(QuarryError::from)?;
        let status = response.status();
        let body = response.text().await.map_err(QuarryError::from)?;

        if status.as_u16() == 408 {
            return Err(QuarryError::Timeout(format!(
                "agent {} backend timed out",
                settings.name
            )));
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(QuarryError::Network(format!(
                "agent {} backend returned {}: {}",
                settings.name, status, body
            )));
        }
        if !status.is_success() {
            let error = ErrorRecord::new(
                "http_error",
                format!("backend returned {}: {}", status, body),
            );
            return Ok(
                AgentRunResult::new(&settings.name, &settings.model, AgentRunStatus::Failed)
                    .with_error(error),
            );
        }

        parse_output(settings, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::tests::fast_retry;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer `responses.len()` requests in order with canned status/body pairs,
    /// returning the base URL and a handle yielding the raw requests
    async fn serve(
        responses: Vec<(u16, String)>,
    ) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
            requests
        });

        (format!("http://{}/run", addr), handle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(split) = text.find("\r\n\r\n") {
                let length = text[..split]
                    .lines()
                    .find_map(|l| {
                        let (name, value) = l.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= split + 4 + length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn provider(endpoint: Option<String>, credential: Option<&str>) -> HttpAgentProvider {
        let mut settings = AgentSettings::new("remote", "research-large").with_retry(fast_retry());
        settings.credential = credential.map(str::to_string);
        HttpAgentProvider::new(
            settings,
            endpoint,
            reqwest::Client::new(),
            CredentialStore::default(),
        )
    }

    #[tokio::test]
    async fn test_missing_endpoint_is_configuration_error() {
        let result = provider(None, None)
            .run_with_retry(&JobContext::default())
            .await
            .unwrap();
        assert_eq!(result.status, AgentRunStatus::ConfigurationError);
    }

    #[tokio::test]
    async fn test_missing_credential_is_configuration_error() {
        let agent = provider(
            Some("http://127.0.0.1:9/run".into()),
            Some("QUARRY_TEST_UNSET_AGENT_KEY"),
        );
        let result = agent.run_with_retry(&JobContext::default()).await.unwrap();
        assert_eq!(result.status, AgentRunStatus::ConfigurationError);
        assert_eq!(result.retry_count, 0);
        assert!(result.errors[0].message.contains("QUARRY_TEST_UNSET_AGENT_KEY"));
    }

    #[tokio::test]
    async fn test_success_response_populates_result() {
        let body = json!({
            "findings": [{"name": "Bodega A"}, {"name": "Bodega B"}],
            "telemetry": {"cost_usd": 0.04, "steps": 12}
        })
        .to_string();
        let (url, server) = serve(vec![(200, body)]).await;

        let context = JobContext::new(json!({"thesis": "premium rioja"})).with_project("wine-sector");
        let result = provider(Some(url), None).run_with_retry(&context).await.unwrap();

        assert_eq!(result.status, AgentRunStatus::Completed);
        assert_eq!(result.items_found(), 2);
        assert!((result.cost() - 0.04).abs() < 1e-9);

        let requests = server.await.unwrap();
        assert!(requests[0].contains("premium rioja"));
        assert!(requests[0].contains("\"model\":\"research-large\""));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let ok = json!({"findings": []}).to_string();
        let (url, server) = serve(vec![(503, "busy".into()), (200, ok)]).await;

        let result = provider(Some(url), None)
            .run_with_retry(&JobContext::default())
            .await
            .unwrap();
        assert_eq!(result.status, AgentRunStatus::Completed);
        assert_eq!(result.retry_count, 1);
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_client_error_fails_without_retry() {
        let (url, server) = serve(vec![(400, "bad request".into())]).await;

        let result = provider(Some(url), None)
            .run_with_retry(&JobContext::default())
            .await
            .unwrap();
        assert_eq!(result.status, AgentRunStatus::Failed);
        assert_eq!(result.errors[0].kind, "http_error");
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_exhausts_retries() {
        let result = provider(Some("http://127.0.0.1:9/run".into()), None)
            .run_with_retry(&JobContext::default())
            .await;
        assert!(result.unwrap_err().is_transient());
    }
}
