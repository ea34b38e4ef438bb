use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// Link to the chat front end.
///
/// `probe` is a cheap liveness check used by the health monitor, `send`
/// delivers a plain text message to a single chat id.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn probe(&self) -> Result<(), TransportError>;

    async fn send(&self, recipient: i64, text: &str) -> Result<(), TransportError>;
}
