use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use url::Url;

use crate::error::{AnalyticsError, Result};
use crate::types::{Batch, LIBRARY_NAME, LIBRARY_VERSION};

/// Outcome of one delivered request
#[derive(Debug, Clone)]
pub struct SendResult {
    pub status: u16,
    pub body: String,
}

impl SendResult {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the same batch may succeed if sent again
    pub fn is_retryable(&self) -> bool {
        self.status == 408 || self.status == 429 || self.status >= 500
    }
}

/// Delivers batches to an analytics endpoint.
///
/// Returns `Ok` for any HTTP response; `Err` only when no response was
/// received (connect failure, timeout).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, url: &Url, batch: &Batch) -> Result<SendResult>;
}

pub struct HttpTransport {
    http_client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AnalyticsError::transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http_client })
    }

    pub fn with_client(http_client: Client) -> Self {
        Self { http_client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, url: &Url, batch: &Batch) -> Result<SendResult> {
        let payload = serde_json::to_string(batch)?;

        let response = self
            .http_client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, format!("{LIBRARY_NAME}/{LIBRARY_VERSION}"))
            .body(payload)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(SendResult { status, body })
    }
}
