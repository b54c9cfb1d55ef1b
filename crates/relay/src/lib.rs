use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;
use vigil_core::{AgentClient, AgentError, StatusSnapshot, DEFAULT_AGENT_PORT, SECRET_HEADER};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub agent_port: u16,
    pub request_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            agent_port: DEFAULT_AGENT_PORT,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// One GET per status request, bearer secret in the designated header,
/// bounded timeout, no retries. Retrying is the user's decision.
pub struct HttpAgentClient {
    client: Client,
    config: RelayConfig,
}

impl HttpAgentClient {
    pub fn new(config: RelayConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("failed to create agent HTTP client")?;
        Ok(Self { client, config })
    }

    fn status_url(&self, address: &str) -> String {
        format!("http://{}:{}/status", address, self.config.agent_port)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn fetch_status(
        &self,
        address: &str,
        secret: &str,
    ) -> std::result::Result<StatusSnapshot, AgentError> {
        let url = self.status_url(address);
        let response = match self
            .client
            .get(&url)
            .header(SECRET_HEADER, secret)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                debug!(url, error = %err, "agent request failed in transport");
                return Err(AgentError::Unreachable);
            }
        };

        match response.status() {
            StatusCode::OK => response.json::<StatusSnapshot>().await.map_err(|err| {
                debug!(url, error = %err, "agent status body did not match schema");
                AgentError::MalformedResponse
            }),
            StatusCode::FORBIDDEN => Err(AgentError::AuthRejected),
            StatusCode::INTERNAL_SERVER_ERROR => Err(AgentError::Misconfigured),
            other => {
                // The peer answered, but not in protocol; same remedy for the
                // user as a bad body.
                debug!(url, status = %other, "agent returned unexpected status");
                Err(AgentError::MalformedResponse)
            }
        }
    }
}
