use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::{FlagSyncError, Result};
use crate::flag::FlagRecord;

pub(crate) const USER_AGENT: &str = concat!("flagsync/", env!("CARGO_PKG_VERSION"));

/// Request/response snapshots of flag state.
///
/// Stateless: every call is an independent request and the caller decides
/// whether to retry.
#[async_trait]
pub trait Requestor: Send + Sync {
    async fn fetch_all(&self) -> Result<HashMap<String, FlagRecord>>;

    async fn fetch_one(&self, key: &str) -> Result<FlagRecord>;
}

/// Turn a non-success response into its error kind and decode the body of a
/// successful one.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: reqwest::Response,
    resource: &str,
) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FlagSyncError::from_status(status.as_u16(), resource, body));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| FlagSyncError::Network(e.to_string()))?;
    serde_json::from_slice(&body).map_err(|e| FlagSyncError::decode(resource, e))
}

pub(crate) fn build_client(config: &SyncConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(config.request_timeout())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Reads flags from the server-side SDK endpoints, authorized by the SDK key.
pub struct HttpRequestor {
    client: reqwest::Client,
    base_url: String,
    sdk_key: String,
}

impl HttpRequestor {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            client: build_client(config),
            base_url: config.base_url("/sdk/latest-flags"),
            sdk_key: config.sdk_key.clone().unwrap_or_default(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str, resource: &str) -> Result<T> {
        debug!(url, "requesting flags");
        let response = self
            .client
            .get(url)
            .header("Authorization", &self.sdk_key)
            .send()
            .await?;
        read_json(response, resource).await
    }
}

#[async_trait]
impl Requestor for HttpRequestor {
    async fn fetch_all(&self) -> Result<HashMap<String, FlagRecord>> {
        self.get(&self.base_url, "all flags").await
    }

    async fn fetch_one(&self, key: &str) -> Result<FlagRecord> {
        let url = format!("{}/{}", self.base_url, key);
        let mut flag: FlagRecord = self.get(&url, key).await?;
        if flag.key.is_empty() {
            flag.key = key.to_string();
        }
        Ok(flag)
    }
}
