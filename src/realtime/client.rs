//! # Real-Time Client
//!
//! One handle owning the subscription registry, connection monitor,
//! reconnection coordinator and presence tracker for a provider.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::config::RealtimeConfig;
use super::errors::{RealtimeError, RealtimeResult};
use super::event::{ChangeEvent, EventFilter};
use super::filter::RowFilter;
use super::monitor::ConnectionMonitor;
use super::presence::{PresenceHandle, PresenceTracker};
use super::provider::RealtimeProvider;
use super::reconnect::{ReconnectOutcome, ReconnectionCoordinator};
use super::state::{ConnectionSnapshot, ConnectionStatus, ConnectionStore};
use super::subscription::{
    ChangeCallback, Subscription, SubscriptionId, SubscriptionRegistry, SubscriptionSpec,
    SubscriptionStatus,
};
use super::telemetry::{NoopTelemetry, TelemetryEvent, TelemetrySink};

/// Realtime client bound to one provider
pub struct RealtimeClient {
    config: RealtimeConfig,
    state: Arc<ConnectionStore>,
    telemetry: Arc<dyn TelemetrySink>,
    registry: Arc<SubscriptionRegistry>,
    presence: Arc<PresenceTracker>,
    monitor: Arc<ConnectionMonitor>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Create a client. Must be called inside a tokio runtime.
    pub fn new(provider: Arc<dyn RealtimeProvider>, config: RealtimeConfig) -> RealtimeResult<Self> {
        Self::with_telemetry(provider, config, Arc::new(NoopTelemetry))
    }

    /// Create a client reporting to `telemetry`
    pub fn with_telemetry(
        provider: Arc<dyn RealtimeProvider>,
        config: RealtimeConfig,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> RealtimeResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| RealtimeError::NoRuntime)?;

        let state = Arc::new(ConnectionStore::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            Arc::clone(&provider),
            Arc::clone(&state),
            Arc::clone(&telemetry),
            runtime.clone(),
            config.schema.clone(),
            config.subscribe_timeout(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&provider),
            Arc::clone(&state),
            Arc::clone(&telemetry),
            runtime.clone(),
            config.subscribe_timeout(),
        ));
        let coordinator = Arc::new(ReconnectionCoordinator::new(
            Arc::clone(&provider),
            Arc::clone(&registry),
            Arc::clone(&presence),
            Arc::clone(&state),
            Arc::clone(&telemetry),
            config.reconnect_timeout(),
        ));
        let monitor = Arc::new(ConnectionMonitor::new(
            provider,
            Arc::clone(&state),
            coordinator,
            Arc::clone(&telemetry),
            config.clone(),
            runtime,
        ));

        Ok(Self {
            config,
            state,
            telemetry,
            registry,
            presence,
            monitor,
            monitor_task: Mutex::new(None),
        })
    }

    /// Start link monitoring. Idempotent.
    pub fn start(&self) {
        if let Some(task) = self.monitor.start() {
            *self
                .monitor_task
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(task);
            tracing::info!(schema = %self.config.schema, "realtime client started");
        }
    }

    /// Stop monitoring, close every subscription and leave every presence channel
    pub fn shutdown(&self) {
        self.monitor.stop();
        self.monitor_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let subscriptions = self.registry.unsubscribe_all();
        let presence = self.presence.untrack_all();
        tracing::info!(subscriptions, presence, "realtime client shut down");
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    // ==================
    // Subscriptions
    // ==================

    /// Subscribe to changes on `table` in the configured schema
    pub fn subscribe<F>(
        &self,
        table: &str,
        event: impl Into<EventFilter>,
        callback: F,
        filter: Option<RowFilter>,
    ) -> RealtimeResult<SubscriptionId>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.registry
            .subscribe(table, event.into(), Arc::new(callback), filter)
    }

    /// Subscribe with an explicit spec, e.g. in another schema
    pub fn subscribe_spec<F>(&self, spec: SubscriptionSpec, callback: F) -> RealtimeResult<SubscriptionId>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.registry.subscribe_spec(spec, Arc::new(callback))
    }

    /// Subscribe with payloads decoded into `T`.
    ///
    /// Events whose payload does not decode are logged, counted as
    /// `DecodeFailed` and dropped.
    pub fn subscribe_typed<T, F>(
        &self,
        table: &str,
        event: impl Into<EventFilter>,
        callback: F,
        filter: Option<RowFilter>,
    ) -> RealtimeResult<SubscriptionId>
    where
        T: DeserializeOwned + 'static,
        F: Fn(ChangeEvent<T>) + Send + Sync + 'static,
    {
        let telemetry = Arc::clone(&self.telemetry);
        let table_name = table.to_string();
        let decoding: ChangeCallback =
            Arc::new(move |event: ChangeEvent| match event.decode::<T>() {
                Ok(typed) => callback(typed),
                Err(e) => {
                    tracing::warn!(table = %table_name, error = %e, "dropping undecodable change");
                    telemetry.record(TelemetryEvent::DecodeFailed);
                }
            });
        self.registry
            .subscribe(table, event.into(), decoding, filter)
    }

    /// Subscribe and receive changes on a channel instead of a callback.
    ///
    /// Dropping the receiver does not unsubscribe.
    pub fn subscribe_stream(
        &self,
        table: &str,
        event: impl Into<EventFilter>,
        filter: Option<RowFilter>,
    ) -> RealtimeResult<(SubscriptionId, mpsc::UnboundedReceiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let forward: ChangeCallback = Arc::new(move |event: ChangeEvent| {
            if tx.send(event).is_err() {
                tracing::trace!("change stream receiver dropped");
            }
        });
        let id = self.registry.subscribe(table, event.into(), forward, filter)?;
        Ok((id, rx))
    }

    /// Close one subscription. Unknown ids are a no-op returning false.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    pub fn unsubscribe_all(&self) -> usize {
        self.registry.unsubscribe_all()
    }

    pub fn subscription_status(&self, id: &SubscriptionId) -> Option<SubscriptionStatus> {
        self.registry.status(id)
    }

    pub fn subscription(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.registry.get(id)
    }

    /// Subscription ids in creation order
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.registry.ids()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    // ==================
    // Connection
    // ==================

    /// Manually re-establish the link and resubscribe everything.
    ///
    /// Also resets the automatic attempt counter.
    pub async fn reconnect(&self) -> RealtimeResult<ReconnectOutcome> {
        self.monitor.reset_attempts();
        self.monitor.reconnect().await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn connection(&self) -> ConnectionSnapshot {
        self.state.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn last_error(&self) -> Option<String> {
        self.state.last_error()
    }

    /// Receiver notified on every connection state change
    pub fn watch_connection(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state.watch()
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    // ==================
    // Presence
    // ==================

    /// Track presence on `channel`
    pub fn track_presence(&self, channel: &str) -> RealtimeResult<PresenceHandle> {
        self.presence.track(channel)
    }

    pub fn untrack_presence(&self, channel: &str) -> bool {
        self.presence.untrack(channel)
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.monitor.stop();
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("status", &self.connection_status())
            .field("subscriptions", &self.subscription_count())
            .field("presence", &self.presence.count())
            .finish_non_exhaustive()
    }
}
