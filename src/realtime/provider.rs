//! # Realtime Provider
//!
//! The backend channel service this crate multiplexes subscriptions onto.
//! Implementations wrap a concrete transport; [`MemoryProvider`] is the
//! in-process one.
//!
//! [`MemoryProvider`]: super::memory::MemoryProvider

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::RealtimeResult;
use super::event::{ChangeEvent, EventFilter, PresenceEventType};
use super::filter::RowFilter;

/// Link state as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Heartbeat signal emitted by the provider link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatSignal {
    Ok,
    Sent,
    Timeout,
    Error,
    Disconnected,
}

impl HeartbeatSignal {
    /// Whether the signal reports a degraded link
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            HeartbeatSignal::Timeout | HeartbeatSignal::Error | HeartbeatSignal::Disconnected
        )
    }
}

/// What a provider channel carries
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSpec {
    /// Row changes on one table
    Changes {
        event: EventFilter,
        schema: String,
        table: String,
        filter: Option<RowFilter>,
    },
    /// Shared presence membership, keyed by this session's id
    Presence { key: String },
}

impl ChannelSpec {
    pub fn table(&self) -> Option<&str> {
        match self {
            ChannelSpec::Changes { table, .. } => Some(table),
            ChannelSpec::Presence { .. } => None,
        }
    }
}

/// Opaque reference to an open provider channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelRef {
    id: u64,
    name: String,
}

impl ChannelRef {
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Message delivered on a provider channel
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Change(ChangeEvent),
    Presence {
        event: PresenceEventType,
        channel: ChannelRef,
    },
}

/// Membership snapshot: presence key to tracked metadata
pub type PresenceSnapshot = HashMap<String, Value>;

/// Receives every message of one channel, in provider order
pub type ChannelSink = Arc<dyn Fn(ChannelMessage) + Send + Sync>;

/// Receives heartbeat signals from the provider link
pub type HeartbeatCallback = Arc<dyn Fn(HeartbeatSignal) + Send + Sync>;

/// Backend realtime channel service.
///
/// `open_channel` and `close_channel` are synchronous bookkeeping on the
/// provider side; the network handshake happens in `subscribe_channel`.
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    /// Create a channel. Fails synchronously on rejection (auth, quota).
    fn open_channel(
        &self,
        name: &str,
        spec: &ChannelSpec,
        sink: ChannelSink,
    ) -> RealtimeResult<ChannelRef>;

    /// Join a previously opened channel.
    async fn subscribe_channel(&self, channel: &ChannelRef) -> RealtimeResult<()>;

    /// Release a channel. Must be safe on an already-closed reference.
    fn close_channel(&self, channel: &ChannelRef) -> RealtimeResult<()>;

    /// Current link state snapshot.
    fn connection_state(&self) -> RealtimeResult<LinkState>;

    /// Register for heartbeat signals. Providers without heartbeats ignore it.
    fn on_heartbeat(&self, _callback: HeartbeatCallback) {}

    /// Re-establish the link after a full disconnect.
    async fn connect(&self) -> RealtimeResult<()>;

    /// Announce this session on a joined presence channel.
    async fn track(&self, channel: &ChannelRef, metadata: Value) -> RealtimeResult<()>;

    /// Canonical membership of a presence channel.
    fn presence_state(&self, channel: &ChannelRef) -> RealtimeResult<PresenceSnapshot>;
}
