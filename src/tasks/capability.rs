//! Capabilities the scheduler drives: fetching a source and storing it.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::models::TaskError;

/// Chunked body of a fetched source.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TaskError>>;

pub struct FetchedSource {
    pub stream: ByteStream,
    /// Total size in bytes, when the source announces it.
    pub size: Option<u64>,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &str) -> Result<FetchedSource, TaskError>;
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Consume `stream` into `destination`, returning the bytes written.
    ///
    /// The stream yields a `Cancelled` error once cancellation is requested;
    /// implementations should stop and return it.
    async fn put(&self, stream: ByteStream, destination: &str) -> Result<u64, TaskError>;

    fn supports_rollback(&self) -> bool {
        false
    }

    /// Discard a partial write at `destination`.
    async fn rollback(&self, _destination: &str) -> Result<(), TaskError> {
        Ok(())
    }
}
