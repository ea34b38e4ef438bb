//! Streaming HTTP source fetcher.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::time::Duration;

use crate::tasks::{FetchedSource, SourceFetcher, TaskError, TaskErrorKind};

/// Fetches `http(s)` URLs, streaming the body chunk by chunk.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// `timeout_secs` bounds connection setup and every body read.
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

fn classify_status(status: StatusCode) -> TaskErrorKind {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => TaskErrorKind::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TaskErrorKind::Permission,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => TaskErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => TaskErrorKind::Network,
        s if s.is_server_error() => TaskErrorKind::Network,
        s if s.is_client_error() => TaskErrorKind::InvalidPayload,
        _ => TaskErrorKind::Unknown,
    }
}

fn classify_error(e: &reqwest::Error) -> TaskError {
    let kind = if e.is_timeout() {
        TaskErrorKind::Timeout
    } else if e.is_builder() {
        TaskErrorKind::InvalidPayload
    } else if e.is_connect() || e.is_request() || e.is_body() || e.is_decode() {
        TaskErrorKind::Network
    } else {
        TaskErrorKind::Unknown
    };
    TaskError::new(kind, e.to_string())
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, source: &str) -> Result<FetchedSource, TaskError> {
        let response = self
            .client
            .get(source)
            .send()
            .await
            .map_err(|e| classify_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TaskError::new(
                classify_status(status),
                format!("GET {} returned {}", source, status),
            ));
        }

        let size = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| classify_error(&e))
            })
            .boxed();

        Ok(FetchedSource { stream, size })
    }
}
