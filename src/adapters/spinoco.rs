//! Spinoco REST API client.
//!
//! Endpoints used:
//! - `GET {base}/calls?page&size&since` returning `{"data": [CallTask]}`
//! - `GET {base}/calls/{guid}/recordings` returning `{"data": [Recording]}`
//! - `GET {base}/recordings/{id}/download` returning the OGG bytes
//!
//! No retry loop here: a failed request is classified transient or
//! permanent and the next run retries it.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use super::{CallTask, RecordingSource, RemoteRecording, SourceError};

/// Envelope of list responses
#[derive(Debug, Deserialize)]
struct DataPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

/// Spinoco API client
pub struct SpinocoClient {
    base_url: String,
    page_size: u32,
    client: reqwest::Client,
}

impl SpinocoClient {
    /// Create a client authenticated with a bearer token
    pub fn new(base_url: &str, token: &str, page_size: u32, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("API token contains characters not allowed in a header")?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            page_size: page_size.max(1),
            client,
        })
    }

    /// Build API URL
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn get_page<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SourceError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| classify_transport(&e, url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, url));
        }

        let page: DataPage<T> = response
            .json()
            .await
            .map_err(|e| SourceError::Permanent(format!("Malformed response from {url}: {e}")))?;
        Ok(page.data)
    }
}

#[async_trait]
impl RecordingSource for SpinocoClient {
    fn name(&self) -> &str {
        "spinoco"
    }

    #[instrument(skip(self))]
    async fn list_calls(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<CallTask>, SourceError> {
        let url = self.url("calls");
        let mut calls = Vec::new();
        let mut page = 0u32;

        loop {
            let mut query = vec![
                ("page", page.to_string()),
                ("size", self.page_size.to_string()),
            ];
            if let Some(since) = since {
                query.push(("since", since.to_rfc3339_opts(SecondsFormat::Secs, true)));
            }

            let batch: Vec<CallTask> = self.get_page(&url, &query).await?;
            debug!(page, count = batch.len(), "Fetched call page");
            if batch.is_empty() {
                break;
            }

            for call in batch {
                if limit.is_some_and(|limit| calls.len() >= limit) {
                    return Ok(calls);
                }
                calls.push(call);
            }
            page += 1;
        }

        Ok(calls)
    }

    async fn list_recordings(&self, call_guid: &str) -> Result<Vec<RemoteRecording>, SourceError> {
        let url = self.url(&format!("calls/{}/recordings", call_guid));
        self.get_page(&url, &[]).await
    }

    #[instrument(skip(self, dest))]
    async fn download(&self, recording_id: &str, dest: &Path) -> Result<u64, SourceError> {
        let url = self.url(&format!("recordings/{}/download", recording_id));
        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_transport(&e, &url))?;

        let status = response.status();
        if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
            return Err(SourceError::Unavailable(recording_id.to_string()));
        }
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }

        let io_err = |e: std::io::Error| {
            SourceError::Transient(format!("Failed to write {}: {}", dest.display(), e))
        };
        let mut file = tokio::fs::File::create(dest).await.map_err(io_err)?;

        let mut total = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_transport(&e, &url))?
        {
            file.write_all(&chunk).await.map_err(io_err)?;
            total += chunk.len() as u64;
        }
        file.flush().await.map_err(io_err)?;

        Ok(total)
    }
}

/// Server trouble and throttling are worth retrying, client errors are not
fn classify_status(status: StatusCode, url: &str) -> SourceError {
    let message = format!("HTTP {} from {}", status.as_u16(), url);
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        SourceError::Transient(message)
    } else {
        SourceError::Permanent(message)
    }
}

fn classify_transport(error: &reqwest::Error, url: &str) -> SourceError {
    let message = format!("Request to {} failed: {}", url, error);
    if error.is_decode() || error.is_builder() {
        SourceError::Permanent(message)
    } else {
        SourceError::Transient(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SpinocoClient {
        SpinocoClient::new("https://api.example.test/", "TOKEN", 50, Duration::from_secs(5))
            .unwrap()
    }

    #[test]
    fn test_url_building() {
        let client = client();
        assert_eq!(client.url("calls"), "https://api.example.test/calls");
        assert_eq!(
            client.url("/recordings/r1/download"),
            "https://api.example.test/recordings/r1/download"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, "u"),
            SourceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "u"),
            SourceError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, "u"),
            SourceError::Permanent(_)
        ));
    }

    #[test]
    fn test_bad_token_rejected() {
        assert!(SpinocoClient::new("https://x", "bad\ntoken", 10, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // Port 9 on localhost is discard; nothing listens there in CI
        let client =
            SpinocoClient::new("http://127.0.0.1:9", "TOKEN", 10, Duration::from_secs(2)).unwrap();
        let err = client.list_recordings("guid").await.unwrap_err();
        assert!(matches!(err, SourceError::Transient(_)));
    }
}
