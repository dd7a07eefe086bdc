use crate::{
    backend::{BackendQueryError, UsageBackend},
    usage::{BillingWindow, SessionSummary, TimeRange, UsageData},
};
use anyhow::{Context, Result};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads usage from another instance's JSON API.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    pub fn new(base_url: &str) -> Result<Self> {
        let normalized = format!("{}/", base_url.trim_end_matches('/'));
        let base = Url::parse(&normalized)
            .with_context(|| format!("invalid remote base url {base_url}"))?;
        let client = Client::builder()
            .user_agent("claude-usage-dashboard/0.1")
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build reqwest client")?;
        Ok(Self { client, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, BackendQueryError> {
        self.base
            .join(path)
            .map_err(|err| BackendQueryError::Transport(err.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, BackendQueryError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| BackendQueryError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendQueryError::Status {
                status: status.as_u16(),
                body: body.trim().to_string(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| BackendQueryError::Transport(err.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|err| BackendQueryError::Decode(err.to_string()))
    }
}

impl UsageBackend for HttpBackend {
    async fn usage_data(&self, range: TimeRange) -> Result<UsageData, BackendQueryError> {
        let mut url = self.endpoint("api/usage")?;
        url.query_pairs_mut().append_pair("range", range.as_str());
        self.get_json(url).await
    }

    async fn billing_windows(&self) -> Result<Vec<BillingWindow>, BackendQueryError> {
        let url = self.endpoint("api/billing-windows")?;
        self.get_json(url).await
    }

    async fn session_breakdown(&self) -> Result<Vec<SessionSummary>, BackendQueryError> {
        let url = self.endpoint("api/sessions")?;
        self.get_json(url).await
    }
}
