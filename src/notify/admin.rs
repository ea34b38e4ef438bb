//! Best-effort fan-out of status messages to the operator chats.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transport::ChatTransport;

/// Sends short status strings to a fixed list of operator chat ids.
///
/// Every delivery runs on its own tokio task. Failures are logged and
/// dropped; nothing is retried and nothing reaches the caller.
pub struct AdminNotifier {
    transport: Option<Arc<dyn ChatTransport>>,
    recipients: Arc<[i64]>,
    enabled: bool,
}

/// Handles of the deliveries spawned by one [`AdminNotifier::notify`] call.
///
/// Dropping it detaches the deliveries. Awaiting [`Delivery::settled`] waits
/// until every one of them finished, successfully or not.
#[derive(Default)]
pub struct Delivery {
    handles: Vec<JoinHandle<()>>,
}

impl Delivery {
    /// Number of deliveries that were dispatched.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub async fn settled(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl AdminNotifier {
    pub fn new(transport: Option<Arc<dyn ChatTransport>>, recipients: Vec<i64>) -> Self {
        let enabled = transport.is_some() && !recipients.is_empty();
        Self {
            transport,
            recipients: recipients.into(),
            enabled,
        }
    }

    /// A notifier that never sends anything.
    pub fn disabled() -> Self {
        Self::new(None, Vec::new())
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Dispatch `message` to every recipient without waiting for delivery.
    pub fn notify(&self, message: impl Into<String>) -> Delivery {
        if !self.enabled {
            return Delivery::default();
        }
        let Some(transport) = self.transport.as_ref() else {
            return Delivery::default();
        };

        let message: Arc<str> = message.into().into();
        let handles = self
            .recipients
            .iter()
            .map(|&recipient| {
                let transport = Arc::clone(transport);
                let message = Arc::clone(&message);
                tokio::spawn(async move {
                    match transport.send(recipient, &message).await {
                        Ok(()) => debug!("Admin notification delivered to {}", recipient),
                        Err(e) => warn!(
                            "Failed to send admin notification to {}: {}",
                            recipient, e
                        ),
                    }
                })
            })
            .collect();

        Delivery { handles }
    }

    pub fn disconnected(&self) -> Delivery {
        self.notify("⚠️ Connection lost, trying to reconnect...")
    }

    pub fn reconnected(&self) -> Delivery {
        self.notify("✅ Connection restored")
    }

    pub fn reconnect_failed(&self) -> Delivery {
        self.notify("❌ Reconnection failed, manual check required")
    }

    pub fn task_failed(&self, title: &str, error: &str) -> Delivery {
        self.notify(format!("❌ Task failed: {}\nError: {}", title, error))
    }

    pub fn task_succeeded(&self, title: &str) -> Delivery {
        self.notify(format!("✅ Task completed: {}", title))
    }

    pub fn startup(&self) -> Delivery {
        self.notify("🚀 Agent started")
    }

    pub fn shutdown(&self) -> Delivery {
        self.notify("👋 Agent shutting down")
    }
}
