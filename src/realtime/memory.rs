//! # In-Memory Provider
//!
//! A scriptable, in-process [`RealtimeProvider`]. Channels, link state,
//! heartbeats and presence live in a single mutex; sinks are always
//! invoked after the lock is released so callbacks may call back in.
//!
//! Dropping the link (`drop_link`) forgets every join, the way a real
//! server forgets channel membership when the socket goes away.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};
use super::event::{ChangeEvent, PresenceEventType};
use super::provider::{
    ChannelMessage, ChannelRef, ChannelSink, ChannelSpec, HeartbeatCallback, HeartbeatSignal,
    LinkState, PresenceSnapshot, RealtimeProvider,
};

struct MemoryChannel {
    name: String,
    spec: ChannelSpec,
    sink: ChannelSink,
    joined: bool,
}

struct MemoryInner {
    link: LinkState,
    link_read_failure: Option<String>,
    next_channel_id: u64,
    channels: BTreeMap<u64, MemoryChannel>,
    presence: HashMap<String, PresenceSnapshot>,
    heartbeat_callbacks: Vec<HeartbeatCallback>,
    connect_failure: Option<String>,
    hang_connect: bool,
    rejected_opens: HashSet<String>,
    rejected_joins: HashSet<String>,
    opened_total: u64,
    closed_total: u64,
    connect_calls: u64,
}

/// In-process realtime provider
pub struct MemoryProvider {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProvider {
    /// A provider whose link is already open
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                link: LinkState::Open,
                link_read_failure: None,
                next_channel_id: 1,
                channels: BTreeMap::new(),
                presence: HashMap::new(),
                heartbeat_callbacks: Vec::new(),
                connect_failure: None,
                hang_connect: false,
                rejected_opens: HashSet::new(),
                rejected_joins: HashSet::new(),
                opened_total: 0,
                closed_total: 0,
                connect_calls: 0,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ==================
    // Link control
    // ==================

    pub fn set_link_state(&self, link: LinkState) {
        self.inner().link = link;
    }

    /// Close the link and forget every join
    pub fn drop_link(&self) {
        let mut inner = self.inner();
        inner.link = LinkState::Closed;
        for channel in inner.channels.values_mut() {
            channel.joined = false;
        }
    }

    /// Make `connection_state` fail until cleared with `None`
    pub fn fail_link_reads(&self, message: Option<&str>) {
        self.inner().link_read_failure = message.map(str::to_string);
    }

    /// Make `connect` fail until cleared with `None`
    pub fn fail_connect(&self, message: Option<&str>) {
        self.inner().connect_failure = message.map(str::to_string);
    }

    /// Make `connect` never complete
    pub fn hang_connect(&self, hang: bool) {
        self.inner().hang_connect = hang;
    }

    /// Deliver a heartbeat signal to every registered callback
    pub fn emit_heartbeat(&self, signal: HeartbeatSignal) {
        let callbacks = self.inner().heartbeat_callbacks.clone();
        for callback in callbacks {
            callback(signal);
        }
    }

    // ==================
    // Channel control
    // ==================

    /// Refuse `open_channel` for a table
    pub fn reject_open(&self, table: &str) {
        self.inner().rejected_opens.insert(table.to_string());
    }

    /// Refuse `subscribe_channel` for a table
    pub fn reject_join(&self, table: &str) {
        self.inner().rejected_joins.insert(table.to_string());
    }

    /// Clear every open/join rejection
    pub fn accept_all(&self) {
        let mut inner = self.inner();
        inner.rejected_opens.clear();
        inner.rejected_joins.clear();
    }

    /// Deliver a change to every joined channel it matches.
    /// Returns the number of channels it reached.
    pub fn emit(&self, event: ChangeEvent) -> usize {
        let targets: Vec<(ChannelSink, Option<String>)> = {
            let inner = self.inner();
            if inner.link != LinkState::Open {
                return 0;
            }
            inner
                .channels
                .values()
                .filter(|channel| channel.joined)
                .filter_map(|channel| match &channel.spec {
                    ChannelSpec::Changes {
                        event: accepted,
                        schema,
                        table,
                        filter,
                    } if accepted.accepts(event.event)
                        && *schema == event.schema
                        && *table == event.table
                        && filter.as_ref().map_or(true, |f| f.matches(&event.data)) =>
                    {
                        Some((channel.sink.clone(), filter.as_ref().map(|f| f.to_string())))
                    }
                    _ => None,
                })
                .collect()
        };

        for (sink, filter) in &targets {
            let mut delivered = event.clone();
            delivered.filter = filter.clone();
            sink(ChannelMessage::Change(delivered));
        }
        targets.len()
    }

    // ==================
    // Presence control
    // ==================

    /// A remote peer joins a presence channel
    pub fn join_presence(&self, channel_name: &str, key: &str, metadata: Value) {
        self.inner()
            .presence
            .entry(channel_name.to_string())
            .or_default()
            .insert(key.to_string(), metadata);
        self.broadcast_presence(channel_name, PresenceEventType::Join);
    }

    /// A remote peer leaves a presence channel
    pub fn leave_presence(&self, channel_name: &str, key: &str) {
        let removed = self
            .inner()
            .presence
            .get_mut(channel_name)
            .and_then(|members| members.remove(key))
            .is_some();
        if removed {
            self.broadcast_presence(channel_name, PresenceEventType::Leave);
        }
    }

    /// Membership by channel name, without going through a channel reference
    pub fn members(&self, channel_name: &str) -> PresenceSnapshot {
        self.inner()
            .presence
            .get(channel_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Send `event` followed by `sync` to every joined presence channel named `channel_name`
    fn broadcast_presence(&self, channel_name: &str, event: PresenceEventType) {
        let targets: Vec<(ChannelSink, ChannelRef)> = {
            let inner = self.inner();
            inner
                .channels
                .iter()
                .filter(|(_, channel)| {
                    channel.joined
                        && channel.name == channel_name
                        && matches!(channel.spec, ChannelSpec::Presence { .. })
                })
                .map(|(id, channel)| (channel.sink.clone(), ChannelRef::new(*id, &channel.name)))
                .collect()
        };

        for (sink, channel) in targets {
            if event != PresenceEventType::Sync {
                sink(ChannelMessage::Presence {
                    event,
                    channel: channel.clone(),
                });
            }
            sink(ChannelMessage::Presence {
                event: PresenceEventType::Sync,
                channel,
            });
        }
    }

    // ==================
    // Inspection
    // ==================

    /// Channels currently open
    pub fn open_channel_count(&self) -> usize {
        self.inner().channels.len()
    }

    /// Channels currently joined
    pub fn joined_channel_count(&self) -> usize {
        self.inner().channels.values().filter(|c| c.joined).count()
    }

    /// Names of open channels, in open order
    pub fn channel_names(&self) -> Vec<String> {
        self.inner()
            .channels
            .values()
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn opened_total(&self) -> u64 {
        self.inner().opened_total
    }

    pub fn closed_total(&self) -> u64 {
        self.inner().closed_total
    }

    pub fn connect_calls(&self) -> u64 {
        self.inner().connect_calls
    }

    pub fn heartbeat_listeners(&self) -> usize {
        self.inner().heartbeat_callbacks.len()
    }
}

#[async_trait]
impl RealtimeProvider for MemoryProvider {
    fn open_channel(
        &self,
        name: &str,
        spec: &ChannelSpec,
        sink: ChannelSink,
    ) -> RealtimeResult<ChannelRef> {
        let mut inner = self.inner();
        if let Some(table) = spec.table() {
            if inner.rejected_opens.contains(table) {
                return Err(RealtimeError::ChannelOpen(format!(
                    "provider rejected channel for table '{}'",
                    table
                )));
            }
        }

        let id = inner.next_channel_id;
        inner.next_channel_id += 1;
        inner.opened_total += 1;
        inner.channels.insert(
            id,
            MemoryChannel {
                name: name.to_string(),
                spec: spec.clone(),
                sink,
                joined: false,
            },
        );
        Ok(ChannelRef::new(id, name))
    }

    async fn subscribe_channel(&self, channel: &ChannelRef) -> RealtimeResult<()> {
        tokio::task::yield_now().await;

        let is_presence = {
            let mut inner = self.inner();
            if inner.link != LinkState::Open {
                return Err(RealtimeError::ChannelJoin("link is not open".into()));
            }
            let rejected = inner.rejected_joins.clone();
            let entry = inner
                .channels
                .get_mut(&channel.id())
                .ok_or_else(|| RealtimeError::ChannelJoin(format!("{} is closed", channel)))?;
            if let Some(table) = entry.spec.table() {
                if rejected.contains(table) {
                    return Err(RealtimeError::ChannelJoin(format!(
                        "provider refused join for table '{}'",
                        table
                    )));
                }
            }
            entry.joined = true;
            matches!(entry.spec, ChannelSpec::Presence { .. })
        };

        if is_presence {
            self.broadcast_presence(channel.name(), PresenceEventType::Sync);
        }
        Ok(())
    }

    fn close_channel(&self, channel: &ChannelRef) -> RealtimeResult<()> {
        let departed = {
            let mut inner = self.inner();
            let Some(removed) = inner.channels.remove(&channel.id()) else {
                return Ok(());
            };
            inner.closed_total += 1;
            match removed.spec {
                ChannelSpec::Presence { key } => inner
                    .presence
                    .get_mut(&removed.name)
                    .and_then(|members| members.remove(&key))
                    .is_some(),
                ChannelSpec::Changes { .. } => false,
            }
        };

        if departed {
            self.broadcast_presence(channel.name(), PresenceEventType::Leave);
        }
        Ok(())
    }

    fn connection_state(&self) -> RealtimeResult<LinkState> {
        let inner = self.inner();
        match &inner.link_read_failure {
            Some(message) => Err(RealtimeError::ConnectionError(message.clone())),
            None => Ok(inner.link),
        }
    }

    fn on_heartbeat(&self, callback: HeartbeatCallback) {
        self.inner().heartbeat_callbacks.push(callback);
    }

    async fn connect(&self) -> RealtimeResult<()> {
        let hang = {
            let mut inner = self.inner();
            inner.connect_calls += 1;
            inner.link = LinkState::Connecting;
            inner.hang_connect
        };
        if hang {
            std::future::pending::<()>().await;
        }

        tokio::task::yield_now().await;

        let mut inner = self.inner();
        match inner.connect_failure.clone() {
            Some(message) => {
                inner.link = LinkState::Closed;
                Err(RealtimeError::ConnectionError(message))
            }
            None => {
                inner.link = LinkState::Open;
                Ok(())
            }
        }
    }

    async fn track(&self, channel: &ChannelRef, metadata: Value) -> RealtimeResult<()> {
        {
            let mut inner = self.inner();
            let key = match inner.channels.get(&channel.id()) {
                Some(MemoryChannel {
                    spec: ChannelSpec::Presence { key },
                    joined: true,
                    ..
                }) => key.clone(),
                _ => return Err(RealtimeError::NotTracking),
            };
            inner
                .presence
                .entry(channel.name().to_string())
                .or_default()
                .insert(key, metadata);
        }

        self.broadcast_presence(channel.name(), PresenceEventType::Join);
        Ok(())
    }

    fn presence_state(&self, channel: &ChannelRef) -> RealtimeResult<PresenceSnapshot> {
        Ok(self.members(channel.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::event::{EventFilter, EventType};
    use serde_json::json;
    use std::sync::Arc;

    fn counting_sink() -> (ChannelSink, Arc<Mutex<Vec<ChannelMessage>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: ChannelSink =
            Arc::new(move |message: ChannelMessage| sink_seen.lock().unwrap().push(message));
        (sink, seen)
    }

    fn changes(table: &str) -> ChannelSpec {
        ChannelSpec::Changes {
            event: EventFilter::All,
            schema: "public".into(),
            table: table.into(),
            filter: None,
        }
    }

    #[tokio::test]
    async fn test_only_joined_channels_receive() {
        let provider = MemoryProvider::new();
        let (sink, seen) = counting_sink();
        let channel = provider.open_channel("c", &changes("widgets"), sink).unwrap();

        let event = ChangeEvent::new(EventType::Insert, "widgets", json!({"id": 1}));
        assert_eq!(provider.emit(event.clone()), 0);

        provider.subscribe_channel(&channel).await.unwrap();
        assert_eq!(provider.emit(event), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let provider = MemoryProvider::new();
        let (sink, _) = counting_sink();
        let channel = provider.open_channel("c", &changes("widgets"), sink).unwrap();

        provider.close_channel(&channel).unwrap();
        provider.close_channel(&channel).unwrap();
        assert_eq!(provider.closed_total(), 1);
        assert!(provider.subscribe_channel(&channel).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_link_forgets_joins() {
        let provider = MemoryProvider::new();
        let (sink, _) = counting_sink();
        let channel = provider.open_channel("c", &changes("widgets"), sink).unwrap();
        provider.subscribe_channel(&channel).await.unwrap();

        provider.drop_link();
        assert_eq!(provider.connection_state().unwrap(), LinkState::Closed);
        assert_eq!(provider.joined_channel_count(), 0);
        assert!(provider.subscribe_channel(&channel).await.is_err());

        provider.connect().await.unwrap();
        assert_eq!(provider.connection_state().unwrap(), LinkState::Open);
        provider.subscribe_channel(&channel).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let provider = MemoryProvider::new();
        provider.fail_connect(Some("unreachable"));
        assert_eq!(
            provider.connect().await,
            Err(RealtimeError::ConnectionError("unreachable".into()))
        );
        assert_eq!(provider.connection_state().unwrap(), LinkState::Closed);
    }

    #[tokio::test]
    async fn test_presence_track_and_leave() {
        let provider = MemoryProvider::new();
        let (sink, seen) = counting_sink();
        let spec = ChannelSpec::Presence { key: "me".into() };
        let channel = provider.open_channel("room", &spec, sink).unwrap();

        assert_eq!(
            provider.track(&channel, json!({})).await,
            Err(RealtimeError::NotTracking)
        );

        provider.subscribe_channel(&channel).await.unwrap();
        provider.track(&channel, json!({"online_at": "now"})).await.unwrap();
        provider.join_presence("room", "peer", json!({}));
        assert_eq!(provider.presence_state(&channel).unwrap().len(), 2);

        provider.close_channel(&channel).unwrap();
        assert_eq!(provider.members("room").len(), 1);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .any(|m| matches!(m, ChannelMessage::Presence { event: PresenceEventType::Sync, .. })));
    }
}
