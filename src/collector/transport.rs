use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;
use url::Url;

/// Carries serialized visits to the ingestion endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Hands the payload to a delivery mechanism that outlives the page.
    /// Returns false when no such mechanism exists or it refused the payload.
    fn send_beacon(&self, _endpoint: &Url, _body: &str) -> bool {
        false
    }

    /// Regular request; resolves once the server acknowledged with a success status.
    async fn post(&self, endpoint: &Url, body: String, timeout: Duration) -> anyhow::Result<()>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    beacon: bool,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            beacon: false,
        }
    }

    /// With beacons enabled, payloads are queued on a detached task and
    /// counted as delivered without waiting for the acknowledgment.
    pub fn with_beacon(mut self, beacon: bool) -> Self {
        self.beacon = beacon;
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn send_beacon(&self, endpoint: &Url, body: &str) -> bool {
        if !self.beacon {
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let request = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_string());
        runtime.spawn(async move {
            if let Err(err) = request.send().await {
                tracing::warn!("Beacon delivery failed: {}", err);
            }
        });
        true
    }

    async fn post(&self, endpoint: &Url, body: String, timeout: Duration) -> anyhow::Result<()> {
        self.client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("posting visit to {endpoint}"))?
            .error_for_status()
            .context("ingestion endpoint rejected the visit")?;
        Ok(())
    }
}
