//! Single-shot HTTP health probe of the gateway.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Result of one probe. Carries the reason when the gateway looks down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> ProbeOutcome;
}

/// Probes a URL with one GET and no retries.
///
/// Any HTTP response below 500 counts as healthy: the gateway answered, even
/// if it did not like the request. Timeouts, refused connections and other
/// transport errors count as unhealthy, as do 5xx responses.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_server_error() => {
                ProbeOutcome::Unhealthy(format!("gateway returned {}", resp.status()))
            }
            Ok(resp) => {
                tracing::debug!(url = %self.url, status = %resp.status(), "probe ok");
                ProbeOutcome::Healthy
            }
            Err(e) if e.is_timeout() => ProbeOutcome::Unhealthy(format!(
                "no response from {} within the probe timeout",
                self.url
            )),
            Err(e) if e.is_connect() => {
                ProbeOutcome::Unhealthy(format!("connection to {} failed: {e}", self.url))
            }
            Err(e) => ProbeOutcome::Unhealthy(format!("request to {} failed: {e}", self.url)),
        }
    }
}
