//! Target version discovery against the cluster proxy.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::errors::{Result, UpdateError};

/// Deadline for a single discovery request.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Version advertisement returned by the proxy's find endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindResponse {
    #[serde(default)]
    pub auto_update: AutoUpdateInfo,
    /// Agent edition; "ent" selects the enterprise distribution.
    #[serde(default)]
    pub edition: String,
    #[serde(default)]
    pub fips: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutoUpdateInfo {
    /// Version the cluster wants agents in this group to run.
    #[serde(default)]
    pub agent_version: String,
}

/// Queries the coordination endpoint for the version this host should run.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn find(&self, proxy: &str, group: &str) -> Result<FindResponse>;
}

/// HTTPS discovery client for the proxy `webapi/find` endpoint.
pub struct WebDiscovery {
    client: reqwest::Client,
}

impl WebDiscovery {
    pub fn new(insecure_skip_verify: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .danger_accept_invalid_certs(insecure_skip_verify)
            .build()
            .map_err(UpdateError::HttpClient)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Discovery for WebDiscovery {
    async fn find(&self, proxy: &str, group: &str) -> Result<FindResponse> {
        let base = proxy_base_url(proxy)?;
        let mut request = self.client.get(format!("{base}/v1/webapi/find"));
        if !group.is_empty() {
            request = request.query(&[("group", group)]);
        }
        let response = request.send().await.map_err(UpdateError::Discovery)?;
        if !response.status().is_success() {
            return Err(UpdateError::DiscoveryStatus(response.status()));
        }
        response.json().await.map_err(UpdateError::Discovery)
    }
}

/// Normalize a `host[:port]` proxy address into a base URL. The scheme is
/// always https; the port defaults to 443.
pub(crate) fn proxy_base_url(proxy: &str) -> Result<String> {
    let trimmed = proxy
        .trim()
        .trim_start_matches("https://")
        .trim_end_matches('/');
    if trimmed.is_empty() || trimmed.contains('/') {
        return Err(UpdateError::Validation(format!(
            "invalid proxy address {proxy:?}"
        )));
    }
    if trimmed.contains(':') {
        Ok(format!("https://{trimmed}"))
    } else {
        Ok(format!("https://{trimmed}:443"))
    }
}
