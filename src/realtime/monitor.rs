//! # Connection Monitor
//!
//! Derives the coarse connection status from the provider's link state
//! and heartbeat signals, and schedules reconnects when the link degrades.
//!
//! Status mapping:
//!
//! | Source                        | Status         |
//! |-------------------------------|----------------|
//! | link `open`                   | `connected`    |
//! | link `connecting`             | `reconnecting` |
//! | link `closing` / `closed`     | `disconnected` |
//! | link read failed              | `error`        |
//! | heartbeat `ok`                | `connected`    |
//! | heartbeat `sent` while not `connected` | `reconnecting` |
//! | heartbeat `timeout`/`error`/`disconnected` | `error` |
//!
//! A heartbeat `sent` on a connected link changes nothing.
//!
//! While a reconnect cycle runs the coordinator owns the status. Failure
//! signals that arrive meanwhile are recorded as the last error and
//! replayed against the link once the cycle ends.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::config::RealtimeConfig;
use super::errors::RealtimeResult;
use super::provider::{HeartbeatSignal, LinkState, RealtimeProvider};
use super::reconnect::{ReconnectOutcome, ReconnectionCoordinator};
use super::state::{ConnectionStatus, ConnectionStore};
use super::telemetry::{TelemetryEvent, TelemetrySink};

/// Map a provider link state onto the coarse status
pub fn derive_status(link: LinkState) -> ConnectionStatus {
    match link {
        LinkState::Open => ConnectionStatus::Connected,
        LinkState::Connecting => ConnectionStatus::Reconnecting,
        LinkState::Closing | LinkState::Closed => ConnectionStatus::Disconnected,
    }
}

/// Status implied by a heartbeat signal arriving in `current`.
///
/// `None` leaves the status as it is.
pub fn heartbeat_status(
    signal: HeartbeatSignal,
    current: ConnectionStatus,
) -> Option<ConnectionStatus> {
    if signal.is_failure() {
        return Some(ConnectionStatus::Error);
    }
    match signal {
        HeartbeatSignal::Ok => Some(ConnectionStatus::Connected),
        HeartbeatSignal::Sent if current == ConnectionStatus::Connected => None,
        _ => Some(ConnectionStatus::Reconnecting),
    }
}

/// Watches the provider link and keeps the connection state current
pub struct ConnectionMonitor {
    provider: Arc<dyn RealtimeProvider>,
    state: Arc<ConnectionStore>,
    coordinator: Arc<ReconnectionCoordinator>,
    telemetry: Arc<dyn TelemetrySink>,
    config: RealtimeConfig,
    runtime: Handle,
    started: AtomicBool,
    /// A reconnect is waiting for its backoff delay or running
    scheduled: AtomicBool,
    attempts: AtomicU32,
    exhausted: AtomicBool,
    /// Failure reported while a reconnect cycle was running
    deferred: Mutex<Option<String>>,
    shutdown: watch::Sender<bool>,
}

impl ConnectionMonitor {
    pub fn new(
        provider: Arc<dyn RealtimeProvider>,
        state: Arc<ConnectionStore>,
        coordinator: Arc<ReconnectionCoordinator>,
        telemetry: Arc<dyn TelemetrySink>,
        config: RealtimeConfig,
        runtime: Handle,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            provider,
            state,
            coordinator,
            telemetry,
            config,
            runtime,
            started: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
            deferred: Mutex::new(None),
            shutdown,
        }
    }

    /// Read the provider link and derive a status. Never fails; a failed
    /// read yields `Error` together with its message.
    pub fn evaluate(&self) -> (ConnectionStatus, Option<String>) {
        match self.provider.connection_state() {
            Ok(link) => (derive_status(link), None),
            Err(e) => (ConnectionStatus::Error, Some(e.to_string())),
        }
    }

    /// One poll: evaluate, publish, maybe schedule a reconnect
    pub fn tick(self: &Arc<Self>) -> ConnectionStatus {
        if let Some(status) = self.replay_deferred() {
            return status;
        }
        let (status, error) = self.evaluate();
        self.apply(status, error);
        status
    }

    /// React to a heartbeat signal from the provider link
    pub fn handle_heartbeat(self: &Arc<Self>, signal: HeartbeatSignal) {
        tracing::trace!(signal = ?signal, "heartbeat");
        match heartbeat_status(signal, self.state.status()) {
            Some(ConnectionStatus::Error) => {
                self.telemetry.record(TelemetryEvent::HeartbeatFailed);
                self.apply(
                    ConnectionStatus::Error,
                    Some(format!("heartbeat {:?}", signal).to_lowercase()),
                );
            }
            Some(status) => self.apply(status, None),
            None => {}
        }
    }

    /// Run a reconnect cycle, then replay any failure reported during it
    pub async fn reconnect(self: &Arc<Self>) -> RealtimeResult<ReconnectOutcome> {
        let result = self.coordinator.reconnect().await;
        self.replay_deferred();
        result
    }

    /// Register for heartbeats and start the poll loop.
    ///
    /// Calling `start` twice returns `None` the second time.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return None;
        }

        let weak = Arc::downgrade(self);
        self.provider.on_heartbeat(Arc::new(move |signal: HeartbeatSignal| {
            if let Some(monitor) = weak.upgrade() {
                monitor.handle_heartbeat(signal);
            }
        }));

        let weak = Arc::downgrade(self);
        let shutdown = self.shutdown.subscribe();
        let period = self.config.poll_interval();
        tracing::debug!(poll_interval_ms = period.as_millis() as u64, "connection monitor started");

        Some(self.runtime.spawn(poll_loop(weak, shutdown, period)))
    }

    /// Stop polling and cancel any pending reconnect. Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Forget previous failed attempts
    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Release);
        self.exhausted.store(false, Ordering::Release);
    }

    fn exhaust_attempts(&self) {
        self.attempts
            .store(self.config.max_reconnect_attempts, Ordering::Release);
    }

    /// Automatic reconnect attempts since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    /// Whether a reconnect is pending or running
    pub fn reconnect_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    /// Whether a failure reported during a reconnect cycle awaits replay
    pub fn has_deferred_failure(&self) -> bool {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Re-evaluate the link for a failure held back during a cycle.
    ///
    /// A link that reads healthy stays `connected` with the failure as its
    /// last error. A cycle that already ended in `error` is left alone.
    /// Anything else is treated as the failure arriving now.
    fn replay_deferred(self: &Arc<Self>) -> Option<ConnectionStatus> {
        if self.coordinator.in_flight() {
            return None;
        }
        let message = self
            .deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        tracing::warn!(error = %message, "link failure reported during reconnect");
        let (status, _) = self.evaluate();
        if status == ConnectionStatus::Connected {
            self.apply(status, None);
            self.state.record_error(message);
            return Some(status);
        }
        if self.state.status() != ConnectionStatus::Error {
            self.apply(ConnectionStatus::Error, Some(message));
        }
        Some(ConnectionStatus::Error)
    }

    fn apply(self: &Arc<Self>, status: ConnectionStatus, error: Option<String>) {
        if self.is_stopped() {
            return;
        }
        // The coordinator owns the status while a cycle runs.
        if self.coordinator.in_flight() {
            tracing::trace!(status = %status, "reconnect in flight, skipping status update");
            if status == ConnectionStatus::Error {
                let message = error.unwrap_or_else(|| "connection error".to_string());
                self.state.record_error(message.clone());
                *self.deferred.lock().unwrap_or_else(PoisonError::into_inner) = Some(message);
            }
            return;
        }

        let changed = match status {
            ConnectionStatus::Error => self
                .state
                .set_error(error.unwrap_or_else(|| "connection error".to_string())),
            _ => self.state.set_status(status),
        };
        if changed {
            tracing::info!(status = %status, "connection status changed");
        }

        match status {
            ConnectionStatus::Connected => self.reset_attempts(),
            ConnectionStatus::Error => self.schedule_reconnect(),
            ConnectionStatus::Disconnected if self.config.reconnect_on_disconnect => {
                self.schedule_reconnect()
            }
            _ => {}
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let attempt = self.attempts.load(Ordering::Acquire);
        if attempt >= self.config.max_reconnect_attempts {
            self.scheduled.store(false, Ordering::Release);
            if !self.exhausted.swap(true, Ordering::AcqRel) {
                tracing::warn!(
                    attempts = attempt,
                    "reconnect attempts exhausted, waiting for manual reconnect"
                );
            }
            return;
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);

        let delay = self.config.backoff_delay(attempt);
        self.telemetry.record(TelemetryEvent::ReconnectScheduled);
        tracing::info!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let weak = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            }

            let Some(monitor) = weak.upgrade() else {
                return;
            };
            let result = monitor.coordinator.reconnect().await;
            match &result {
                Ok(ReconnectOutcome::Completed(_)) => monitor.reset_attempts(),
                Ok(ReconnectOutcome::AlreadyInFlight) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(error = %e, "scheduled reconnect failed");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "scheduled reconnect failed permanently");
                    monitor.exhaust_attempts();
                }
            }
            monitor.scheduled.store(false, Ordering::Release);
            monitor.replay_deferred();
        });
    }
}

async fn poll_loop(
    monitor: Weak<ConnectionMonitor>,
    mut shutdown: watch::Receiver<bool>,
    period: std::time::Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.tick();
            }
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        }
    }

    tracing::debug!("connection monitor stopped");
}

impl fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("attempts", &self.attempts())
            .field("scheduled", &self.reconnect_scheduled())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
