//! Connection health monitoring.
//!
//! Probes the chat transport on a fixed interval and drives the
//! reconnection state machine. The current [`ConnectionState`] is published
//! on a watch channel so the task scheduler can pause dispatch while the link
//! is down.

mod monitor;

pub use monitor::{
    reconnect_backoff, ConnectionState, HealthEvent, HealthMonitor, MonitorStatus,
    MAX_RECONNECT_BACKOFF_SECS,
};
