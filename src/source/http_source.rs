use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use tracing::{debug, warn};

use super::traits::RangeSource;

/// Facts learned from probing an origin.
#[derive(Debug, Clone)]
pub struct OriginInfo {
    pub content_length: u64,
    pub content_type: String,
}

/// A single remote file fetched with HTTP range requests.
pub struct HttpOrigin {
    client: Client,
    url: Url,
}

impl HttpOrigin {
    pub fn new(client: Client, url: Url) -> Self {
        Self { client, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send a one-byte range request to learn the total length.
    ///
    /// The origin must answer 206; items that cannot be fetched by range
    /// cannot be served while they are still downloading.
    pub async fn inspect(&self) -> Result<OriginInfo> {
        let resp = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::RANGE, "bytes=0-0")
            .send()
            .await
            .with_context(|| format!("range request to {} failed", self.url))?;

        let status = resp.status();
        debug!("http inspect status={}", status.as_u16());
        if !status.is_success() {
            warn!("http inspect failed status={}", status.as_u16());
            return Err(anyhow!("origin rejected range request: HTTP {}", status.as_u16()));
        }
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(anyhow!(
                "origin does not support range requests: {}",
                self.url
            ));
        }

        // Content-Range: bytes 0-0/<total>
        let content_length = resp
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| anyhow!("origin sent no usable Content-Range: {}", self.url))?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();

        Ok(OriginInfo {
            content_length,
            content_type,
        })
    }
}

#[async_trait]
impl RangeSource for HttpOrigin {
    async fn fetch_range(&self, start: u64, end: u64) -> Result<Bytes> {
        let range = format!("bytes={}-{}", start, end);
        let resp = self
            .client
            .get(self.url.clone())
            .header(reqwest::header::RANGE, &range)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            warn!(
                "http fetch failed status={} range={}",
                status.as_u16(),
                range
            );
            return Err(anyhow!("fetch_range failed: HTTP {}", status.as_u16()));
        }

        let bytes = resp.bytes().await?;
        let expected = (end - start + 1) as usize;
        if bytes.len() != expected {
            return Err(anyhow!(
                "short range response: got {} bytes, expected {}",
                bytes.len(),
                expected
            ));
        }
        Ok(bytes)
    }
}
