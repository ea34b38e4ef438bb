//! Operator notifications and the chat transport capability they ride on.

mod admin;
mod transport;

pub use admin::{AdminNotifier, Delivery};
pub use transport::{ChatTransport, TransportError};
