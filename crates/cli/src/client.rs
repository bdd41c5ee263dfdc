//! HTTP client for the container monitor daemon API

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Client for the daemon's query and admin endpoints
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid endpoint URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.join(path).context("Invalid path")?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// GET `path` with query parameters
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(path, query)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to reach the monitor daemon")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// POST to `path` without a body
    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path, &[])?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .context("Failed to reach the monitor daemon")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("API error ({}): {}", status, body);
        }

        response.json().await.context("Failed to parse response")
    }

    /// Component health; an unhealthy daemon answers 503 with the same body
    pub async fn health(&self) -> Result<HealthReport> {
        let url = self.url("healthz", &[])?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to reach the monitor daemon")?;

        match response.status() {
            StatusCode::OK | StatusCode::SERVICE_UNAVAILABLE => {
                response.json().await.context("Failed to parse health response")
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("API error ({}): {}", status, body)
            }
        }
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub workload_id: String,
    pub workload_name: String,
    pub cpu_percent: f64,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub mem_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub process_count: u64,
    pub collected_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub workload_id: String,
    pub workload_name: String,
    pub source: String,
    #[serde(default)]
    pub level: Option<String>,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub components: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub stats: u64,
    pub logs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TierCounts {
    pub tier1: u64,
    pub tier2: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PruneReport {
    pub now: String,
    pub stats: TierCounts,
    pub logs: TierCounts,
    pub elapsed_ms: u64,
}
