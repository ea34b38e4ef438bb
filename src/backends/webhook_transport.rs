//! Chat transport speaking to a bot gateway over HTTP.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use crate::notify::{ChatTransport, TransportError};

#[derive(Serialize)]
struct OutgoingMessage<'a> {
    recipient: i64,
    text: &'a str,
}

/// Probes a health URL and posts messages to a webhook URL.
pub struct WebhookTransport {
    client: reqwest::Client,
    probe_url: String,
    webhook_url: String,
}

impl WebhookTransport {
    pub fn new(probe_url: String, webhook_url: String, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            probe_url,
            webhook_url,
        })
    }
}

#[async_trait]
impl ChatTransport for WebhookTransport {
    async fn probe(&self) -> Result<(), TransportError> {
        let response = self
            .client
            .get(&self.probe_url)
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Unavailable(format!(
                "health check returned {}",
                response.status()
            )))
        }
    }

    async fn send(&self, recipient: i64, text: &str) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&OutgoingMessage { recipient, text })
            .send()
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(TransportError::Rejected(format!(
                "message to {} rejected with {}",
                recipient, status
            )))
        } else {
            Err(TransportError::Unavailable(format!(
                "message to {} failed with {}",
                recipient, status
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_port_url(path: &str) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}{}", port, path)
    }

    #[test]
    fn test_message_body() {
        let body = serde_json::to_value(OutgoingMessage {
            recipient: -100123,
            text: "hi",
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "recipient": -100123, "text": "hi" }));
    }

    #[tokio::test]
    async fn test_probe_unreachable_gateway() {
        let transport =
            WebhookTransport::new(closed_port_url("/health"), closed_port_url("/send"), 5).unwrap();

        let result = transport.probe().await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_send_unreachable_gateway() {
        let transport =
            WebhookTransport::new(closed_port_url("/health"), closed_port_url("/send"), 5).unwrap();

        let result = transport.send(1, "hello").await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
    }
}
