//! # Reconnection
//!
//! Rebuilds every provider channel after the link was lost. Subscription
//! ids and callbacks are carried over unchanged; only the channel behind
//! each subscription is replaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use super::errors::{RealtimeError, RealtimeResult};
use super::presence::PresenceTracker;
use super::provider::RealtimeProvider;
use super::state::{ConnectionStatus, ConnectionStore};
use super::subscription::{SubscriptionId, SubscriptionRegistry};
use super::telemetry::{TelemetryEvent, TelemetrySink};

/// Result of one completed reconnect cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectReport {
    /// Subscriptions whose fresh channel joined
    pub resubscribed: Vec<SubscriptionId>,
    /// Subscriptions left in `Error`
    pub failed: Vec<SubscriptionId>,
    /// Presence channels rejoined
    pub presence_rejoined: usize,
}

/// What a call to `reconnect` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Completed(ReconnectReport),
    /// Another cycle was running; this call did nothing
    AlreadyInFlight,
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Serializes reconnect cycles and rebuilds the registry's channels
pub struct ReconnectionCoordinator {
    provider: Arc<dyn RealtimeProvider>,
    registry: Arc<SubscriptionRegistry>,
    presence: Arc<PresenceTracker>,
    state: Arc<ConnectionStore>,
    telemetry: Arc<dyn TelemetrySink>,
    connect_timeout: Duration,
    in_flight: AtomicBool,
}

impl ReconnectionCoordinator {
    pub fn new(
        provider: Arc<dyn RealtimeProvider>,
        registry: Arc<SubscriptionRegistry>,
        presence: Arc<PresenceTracker>,
        state: Arc<ConnectionStore>,
        telemetry: Arc<dyn TelemetrySink>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            registry,
            presence,
            state,
            telemetry,
            connect_timeout,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a cycle is currently running
    pub fn in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Re-establish the link and resubscribe everything.
    ///
    /// Concurrent calls while a cycle runs return `AlreadyInFlight`. A link
    /// failure leaves the state in `Error` and is returned; there is no
    /// internal retry.
    pub async fn reconnect(&self) -> RealtimeResult<ReconnectOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("reconnect already in flight");
            return Ok(ReconnectOutcome::AlreadyInFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        self.state.set_status(ConnectionStatus::Reconnecting);
        self.telemetry.record(TelemetryEvent::ReconnectStarted);
        tracing::info!(subscriptions = self.registry.len(), "reconnecting");

        if let Err(e) = self.connect_link().await {
            tracing::warn!(error = %e, "reconnect failed");
            self.state.set_error(e.to_string());
            self.telemetry.record(TelemetryEvent::ReconnectFailed);
            return Err(e);
        }

        let mut report = self.resubscribe_all().await;
        report.presence_rejoined = self.presence.rejoin_all().await;

        self.state.set_status(ConnectionStatus::Connected);
        self.telemetry.record(TelemetryEvent::ReconnectSucceeded);
        tracing::info!(
            resubscribed = report.resubscribed.len(),
            failed = report.failed.len(),
            presence = report.presence_rejoined,
            "reconnected"
        );

        Ok(ReconnectOutcome::Completed(report))
    }

    async fn connect_link(&self) -> RealtimeResult<()> {
        match tokio::time::timeout(self.connect_timeout, self.provider.connect()).await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::ConnectionTimeout(
                self.connect_timeout.as_millis() as u64,
            )),
        }
    }

    async fn resubscribe_all(&self) -> ReconnectReport {
        let targets = self.registry.snapshot();
        let mut report = ReconnectReport::default();
        let mut joins = Vec::with_capacity(targets.len());

        for target in targets {
            self.registry.close_quietly(&target.channel);

            let channel = match self
                .registry
                .open_channel(target.id, &target.spec, &target.callback)
            {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(subscription_id = %target.id, error = %e, "resubscribe open failed");
                    self.registry.mark_failed(&target.id);
                    self.state.record_error(e.to_string());
                    self.telemetry.record(TelemetryEvent::SubscriptionFailed);
                    report.failed.push(target.id);
                    continue;
                }
            };

            match self.registry.rebind(&target.id, channel.clone()) {
                Some(generation) => {
                    let joiner = self.registry.joiner();
                    let id = target.id;
                    joins.push(async move { (id, joiner.run(id, channel, generation).await) });
                }
                // Unsubscribed while we were reopening.
                None => self.registry.close_quietly(&channel),
            }
        }

        for (id, result) in join_all(joins).await {
            match result {
                Ok(()) => report.resubscribed.push(id),
                Err(_) => report.failed.push(id),
            }
        }

        report
    }
}
