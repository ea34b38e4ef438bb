use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::HealthSettings;
use crate::notify::{ChatTransport, TransportError};

/// Upper bound of a single reconnection backoff sleep.
pub const MAX_RECONNECT_BACKOFF_SECS: u64 = 60;

/// Sleep before reconnection attempt `attempt` (1-based): `min(attempt², 60)` seconds.
pub fn reconnect_backoff(attempt: u32) -> Duration {
    let attempt = attempt as u64;
    Duration::from_secs(
        attempt
            .saturating_mul(attempt)
            .min(MAX_RECONNECT_BACKOFF_SECS),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Unknown,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events emitted by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthEvent {
    /// Failure threshold reached, reconnection started.
    Disconnected,
    /// Link is back after a failure episode.
    Reconnected,
    /// Every reconnection attempt of an episode failed.
    ReconnectFailed,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorStatus {
    pub state: ConnectionState,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

struct MonitorState {
    state: ConnectionState,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Incremented every time a failure episode starts.
    episode: u64,
}

type EventHandler = Arc<dyn Fn() + Send + Sync>;

/// Periodic liveness prober and reconnection state machine.
///
/// The probe loop and the reconnection procedure both mutate the shared
/// state, always under `state`. Subscribed handlers run on their own tasks
/// so a slow handler never stalls probing.
pub struct HealthMonitor {
    transport: Arc<dyn ChatTransport>,
    settings: HealthSettings,
    state: Mutex<MonitorState>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<HealthEvent>,
    handlers: Mutex<Vec<(HealthEvent, EventHandler)>>,
    cancel: Mutex<CancellationToken>,
}

impl HealthMonitor {
    pub fn new(transport: Arc<dyn ChatTransport>, settings: HealthSettings) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Unknown);
        let (events_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            transport,
            settings,
            state: Mutex::new(MonitorState {
                state: ConnectionState::Unknown,
                consecutive_failures: 0,
                last_success: None,
                last_error: None,
                episode: 0,
            }),
            state_tx,
            events_tx,
            handlers: Mutex::new(Vec::new()),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    /// Register `handler` for `event`. Each firing runs it on a fresh task.
    pub fn on<F>(&self, event: HealthEvent, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event, Arc::new(handler)));
    }

    /// Receiver of every connection state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_state().state
    }

    pub fn status(&self) -> MonitorStatus {
        let st = self.lock_state();
        MonitorStatus {
            state: st.state,
            last_success: st.last_success,
            last_error: st.last_error.clone(),
            consecutive_failures: st.consecutive_failures,
        }
    }

    /// Start the probe loop. It runs until `parent` is cancelled or
    /// [`HealthMonitor::stop`] is called.
    pub fn start(self: &Arc<Self>, parent: &CancellationToken) -> JoinHandle<()> {
        let token = parent.child_token();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();

        {
            let mut st = self.lock_state();
            self.transition(&mut st, ConnectionState::Connecting);
        }

        let monitor = Arc::clone(self);
        tokio::spawn(async move { monitor.probe_loop(token).await })
    }

    /// Cancel the probe loop and any reconnection in progress.
    pub fn stop(&self) {
        info!("Stopping connection health monitor");
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }

    async fn probe_loop(self: Arc<Self>, token: CancellationToken) {
        let period = Duration::from_secs(self.settings.check_interval_secs.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Connection health monitor started (interval: {:?}, failure threshold: {})",
            period, self.settings.failure_threshold
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = token.cancelled() => break,
                result = self.transport.probe() => result,
            };
            self.record_probe(result, &token);
        }

        debug!("Connection health monitor loop exited");
    }

    fn record_probe(self: &Arc<Self>, result: Result<(), TransportError>, token: &CancellationToken) {
        let mut st = self.lock_state();
        match result {
            Ok(()) => {
                st.consecutive_failures = 0;
                st.last_success = Some(Utc::now());
                match st.state {
                    ConnectionState::Reconnecting | ConnectionState::Disconnected => {
                        info!("Connection restored");
                        self.transition(&mut st, ConnectionState::Connected);
                        self.fire(HealthEvent::Reconnected, token);
                    }
                    ConnectionState::Unknown | ConnectionState::Connecting => {
                        self.transition(&mut st, ConnectionState::Connected);
                    }
                    ConnectionState::Connected => {}
                }
            }
            Err(e) => {
                st.consecutive_failures += 1;
                warn!(
                    "Health check failed: {} (consecutive failures: {})",
                    e, st.consecutive_failures
                );
                st.last_error = Some(e.to_string());

                let threshold = self.settings.failure_threshold.max(1);
                // A monitor left `Disconnected` by a failed episode starts a
                // new one on the next failure.
                if st.consecutive_failures >= threshold
                    && st.state != ConnectionState::Reconnecting
                {
                    st.episode += 1;
                    let episode = st.episode;
                    self.transition(&mut st, ConnectionState::Reconnecting);
                    self.fire(HealthEvent::Disconnected, token);

                    let monitor = Arc::clone(self);
                    let token = token.clone();
                    tokio::spawn(async move { monitor.reconnect(episode, token).await });
                }
            }
        }
    }

    /// Reconnection procedure of one failure episode.
    async fn reconnect(self: Arc<Self>, episode: u64, token: CancellationToken) {
        warn!("Connection unstable, attempting to reconnect...");
        let max_retries = self.settings.max_retries;

        for attempt in 1..=max_retries {
            let delay = reconnect_backoff(attempt);
            info!(
                "Reconnect attempt {}/{} in {:?}",
                attempt, max_retries, delay
            );
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if !self.episode_active(episode) {
                debug!("Reconnection episode {} already resolved", episode);
                return;
            }

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.transport.probe() => result,
            };

            let mut st = self.lock_state();
            if st.episode != episode || st.state != ConnectionState::Reconnecting {
                return;
            }
            match result {
                Ok(()) => {
                    st.consecutive_failures = 0;
                    st.last_success = Some(Utc::now());
                    info!("Reconnected on attempt {}", attempt);
                    self.transition(&mut st, ConnectionState::Connected);
                    self.fire(HealthEvent::Reconnected, &token);
                    return;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    st.last_error = Some(e.to_string());
                }
            }
        }

        let mut st = self.lock_state();
        if st.episode == episode && st.state == ConnectionState::Reconnecting {
            error!("Max reconnection attempts reached, manual intervention required");
            self.transition(&mut st, ConnectionState::Disconnected);
            self.fire(HealthEvent::ReconnectFailed, &token);
        }
    }

    fn episode_active(&self, episode: u64) -> bool {
        let st = self.lock_state();
        st.episode == episode && st.state == ConnectionState::Reconnecting
    }

    fn transition(&self, st: &mut MonitorState, next: ConnectionState) {
        if st.state == next {
            return;
        }
        info!("Connection state: {} -> {}", st.state, next);
        st.state = next;
        self.state_tx.send_replace(next);
    }

    fn fire(&self, event: HealthEvent, token: &CancellationToken) {
        if token.is_cancelled() {
            return;
        }
        let _ = self.events_tx.send(event);

        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, handler) in handlers.iter().filter(|(e, _)| *e == event) {
            let handler = Arc::clone(handler);
            tokio::spawn(async move { handler() });
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
