//! # Real-Time Telemetry
//!
//! Best-effort counters for the subscription engine. The engine calls
//! `record` inline and never waits on the sink.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Something the engine wants counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryEvent {
    SubscriptionOpened,
    SubscriptionClosed,
    SubscriptionFailed,
    EventDelivered,
    DecodeFailed,
    HeartbeatFailed,
    ReconnectScheduled,
    ReconnectStarted,
    ReconnectSucceeded,
    ReconnectFailed,
    PresenceSynced,
}

/// Fire-and-forget telemetry sink
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Atomic counters behind a `TelemetrySink`.
///
/// Relaxed ordering throughout; counters are informational.
#[derive(Debug, Default)]
pub struct RealtimeMetrics {
    subscriptions_opened: AtomicU64,
    subscriptions_closed: AtomicU64,
    subscription_failures: AtomicU64,
    events_delivered: AtomicU64,
    decode_failures: AtomicU64,
    heartbeat_failures: AtomicU64,
    reconnects_scheduled: AtomicU64,
    reconnects_started: AtomicU64,
    reconnects_succeeded: AtomicU64,
    reconnects_failed: AtomicU64,
    presence_syncs: AtomicU64,
}

impl RealtimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            subscriptions_opened: self.subscriptions_opened.load(Ordering::Relaxed),
            subscriptions_closed: self.subscriptions_closed.load(Ordering::Relaxed),
            subscription_failures: self.subscription_failures.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            heartbeat_failures: self.heartbeat_failures.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
            reconnects_started: self.reconnects_started.load(Ordering::Relaxed),
            reconnects_succeeded: self.reconnects_succeeded.load(Ordering::Relaxed),
            reconnects_failed: self.reconnects_failed.load(Ordering::Relaxed),
            presence_syncs: self.presence_syncs.load(Ordering::Relaxed),
        }
    }

    fn counter(&self, event: TelemetryEvent) -> &AtomicU64 {
        match event {
            TelemetryEvent::SubscriptionOpened => &self.subscriptions_opened,
            TelemetryEvent::SubscriptionClosed => &self.subscriptions_closed,
            TelemetryEvent::SubscriptionFailed => &self.subscription_failures,
            TelemetryEvent::EventDelivered => &self.events_delivered,
            TelemetryEvent::DecodeFailed => &self.decode_failures,
            TelemetryEvent::HeartbeatFailed => &self.heartbeat_failures,
            TelemetryEvent::ReconnectScheduled => &self.reconnects_scheduled,
            TelemetryEvent::ReconnectStarted => &self.reconnects_started,
            TelemetryEvent::ReconnectSucceeded => &self.reconnects_succeeded,
            TelemetryEvent::ReconnectFailed => &self.reconnects_failed,
            TelemetryEvent::PresenceSynced => &self.presence_syncs,
        }
    }
}

impl TelemetrySink for RealtimeMetrics {
    fn record(&self, event: TelemetryEvent) {
        self.counter(event).fetch_add(1, Ordering::Relaxed);
    }
}

/// Serializable copy of [`RealtimeMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub subscriptions_opened: u64,
    pub subscriptions_closed: u64,
    pub subscription_failures: u64,
    pub events_delivered: u64,
    pub decode_failures: u64,
    pub heartbeat_failures: u64,
    pub reconnects_scheduled: u64,
    pub reconnects_started: u64,
    pub reconnects_succeeded: u64,
    pub reconnects_failed: u64,
    pub presence_syncs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let metrics = RealtimeMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_record_increments_matching_counter() {
        let metrics = RealtimeMetrics::new();
        metrics.record(TelemetryEvent::EventDelivered);
        metrics.record(TelemetryEvent::EventDelivered);
        metrics.record(TelemetryEvent::ReconnectFailed);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.events_delivered, 2);
        assert_eq!(snapshot.reconnects_failed, 1);
        assert_eq!(snapshot.reconnects_succeeded, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = RealtimeMetrics::new();
        metrics.record(TelemetryEvent::SubscriptionOpened);
        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["subscriptions_opened"], 1);
    }
}
