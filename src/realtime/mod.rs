//! # Dossier Real-Time Module
//!
//! Live table subscriptions, connection health and presence on top of a
//! backend realtime channel service.
//!
//! ## Architecture
//!
//! - **Provider**: the backend channel service, behind [`RealtimeProvider`]
//! - **Subscriptions**: registry of live table subscriptions and their channels
//! - **Monitor**: derives the connection status from link state and heartbeats
//! - **Reconnect**: rebuilds every channel after the link comes back
//! - **Presence**: who else is viewing the same dossier
//! - **Client**: one facade owning all of the above
//!
//! Change delivery is at-most-once. Events emitted while the link is down
//! are not replayed after a reconnect.

pub mod client;
pub mod config;
pub mod errors;
pub mod event;
pub mod filter;
pub mod memory;
pub mod monitor;
pub mod presence;
pub mod provider;
pub mod reconnect;
pub mod state;
pub mod subscription;
pub mod telemetry;

pub use client::RealtimeClient;
pub use config::{BackoffStrategy, RealtimeConfig};
pub use errors::{RealtimeError, RealtimeResult};
pub use event::{ChangeEvent, EventFilter, EventType, PresenceEventType};
pub use filter::{FilterOp, RowFilter};
pub use memory::MemoryProvider;
pub use monitor::{derive_status, heartbeat_status, ConnectionMonitor};
pub use presence::{PresenceHandle, PresenceTracker, PresenceView};
pub use provider::{
    ChannelMessage, ChannelRef, ChannelSink, ChannelSpec, HeartbeatCallback, HeartbeatSignal,
    LinkState, PresenceSnapshot, RealtimeProvider,
};
pub use reconnect::{ReconnectOutcome, ReconnectReport, ReconnectionCoordinator};
pub use state::{ConnectionSnapshot, ConnectionStatus, ConnectionStore};
pub use subscription::{
    ChangeCallback, ChannelHandle, Subscription, SubscriptionId, SubscriptionRegistry,
    SubscriptionSpec, SubscriptionStatus,
};
pub use telemetry::{MetricsSnapshot, NoopTelemetry, RealtimeMetrics, TelemetryEvent, TelemetrySink};
