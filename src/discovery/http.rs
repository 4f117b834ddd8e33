//! Client of the discovery HTTP API.
//!
//! ```text
//! GET  {base}/messaging-discovery/entry/{pk}        -> Entry
//! POST {base}/messaging-discovery/entry/            <- Entry
//! GET  {base}/messaging-discovery/available_servers -> [Entry]
//! ```
//!
//! Failures are reported as `{"message": "..."}` with a non-200 status.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::trace;

use super::{Discovery, DiscoveryError, Entry};
use crate::crypto::PubKey;

const API_PREFIX: &str = "messaging-discovery";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Discovery over HTTP.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    base: String,
    client: reqwest::Client,
}

impl HttpDiscovery {
    /// Client for the service at `base` (for example `http://127.0.0.1:9090`).
    pub fn new(base: impl Into<String>) -> Result<Self, DiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self::with_client(base, client))
    }

    /// Use a preconfigured reqwest client.
    pub fn with_client(base: impl Into<String>, client: reqwest::Client) -> Self {
        let base = base.into().trim_end_matches('/').to_string();
        Self { base, client }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base, API_PREFIX, path)
    }

    async fn check(resp: Response) -> Result<Response, DiscoveryError> {
        let status = resp.status();
        if status == StatusCode::OK {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(error_from_body(status.as_u16(), &body))
    }
}

/// Map a non-200 response to a typed error.
fn error_from_body(status: u16, body: &str) -> DiscoveryError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let lower = message.to_lowercase();

    if status == StatusCode::NOT_FOUND.as_u16() || lower.contains("not found") {
        DiscoveryError::EntryNotFound
    } else if lower.contains("sequence") {
        DiscoveryError::WrongSequence
    } else if lower.contains("signature") {
        DiscoveryError::InvalidSignature
    } else {
        DiscoveryError::Server { status, message }
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn entry(&self, pk: &PubKey) -> Result<Entry, DiscoveryError> {
        let url = self.url(&format!("entry/{pk}"));
        trace!(%url, "fetching entry");
        let resp = Self::check(self.client.get(url).send().await?).await?;
        Ok(resp.json().await?)
    }

    async fn set_entry(&self, entry: &Entry) -> Result<(), DiscoveryError> {
        let url = self.url("entry/");
        trace!(%url, seq = entry.sequence, "posting entry");
        Self::check(self.client.post(url).json(entry).send().await?).await?;
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<Entry>, DiscoveryError> {
        let url = self.url("available_servers");
        let resp = Self::check(self.client.get(url).send().await?).await?;
        Ok(resp.json().await?)
    }
}
