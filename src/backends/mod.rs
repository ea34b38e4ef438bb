//! Built-in collaborators wired up by the agent binary.

mod http_fetcher;
mod local_storage;
mod webhook_transport;

pub use http_fetcher::HttpFetcher;
pub use local_storage::LocalStorage;
pub use webhook_transport::WebhookTransport;
