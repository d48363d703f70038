//! # Subscription Management
//!
//! The registry of live subscriptions and the provider channel each one is
//! bound to.
//!
//! A subscription keeps its id and callback for its whole life. The
//! provider channel behind it ([`ChannelHandle`]) is replaced on every
//! reconnect; a generation number tells a current handshake result from
//! a stale one.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use uuid::Uuid;

use super::errors::{RealtimeError, RealtimeResult};
use super::event::{ChangeEvent, EventFilter};
use super::filter::RowFilter;
use super::provider::{ChannelMessage, ChannelRef, ChannelSink, ChannelSpec, RealtimeProvider};
use super::state::ConnectionStore;
use super::telemetry::{TelemetryEvent, TelemetrySink};

/// Caller-supplied change callback
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Unique subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subscription status
///
/// A subscription is `Unsubscribed` until its join handshake is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Subscribed,
    Unsubscribed,
    Error,
}

/// What a subscription listens to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSpec {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<RowFilter>,
}

impl SubscriptionSpec {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, event: EventFilter) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            event,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: RowFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Provider channel name for a subscription with this spec
    pub fn channel_name(&self, id: SubscriptionId) -> String {
        format!("realtime:{}:{}:{}", self.schema, self.table, id)
    }

    fn validate(&self) -> RealtimeResult<()> {
        let valid = |s: &str| !s.is_empty() && !s.contains(':') && !s.contains(char::is_whitespace);
        if !valid(&self.schema) {
            return Err(RealtimeError::InvalidTopic(format!("schema '{}'", self.schema)));
        }
        if !valid(&self.table) {
            return Err(RealtimeError::InvalidTopic(format!("table '{}'", self.table)));
        }
        Ok(())
    }

    fn channel_spec(&self) -> ChannelSpec {
        ChannelSpec::Changes {
            event: self.event,
            schema: self.schema.clone(),
            table: self.table.clone(),
            filter: self.filter.clone(),
        }
    }
}

/// A subscription to table changes
#[derive(Clone)]
pub struct Subscription {
    /// Unique subscription ID
    pub id: SubscriptionId,

    /// Stream, event and row filter
    pub spec: SubscriptionSpec,

    /// Current status
    pub status: SubscriptionStatus,

    /// When `subscribe` was called
    pub created_at: DateTime<Utc>,

    callback: ChangeCallback,
}

impl Subscription {
    /// The callback every delivered event is forwarded to
    pub fn callback(&self) -> &ChangeCallback {
        &self.callback
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Binding of one subscription to its current provider channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    pub channel: ChannelRef,
    pub generation: u64,
}

#[derive(Debug)]
struct Entry {
    subscription: Subscription,
    handle: ChannelHandle,
}

#[derive(Debug, Default)]
struct SubscriptionTable {
    by_id: HashMap<SubscriptionId, Entry>,
    /// Insertion order; reconnects resubscribe in this order
    order: Vec<SubscriptionId>,
    by_table: HashMap<String, HashSet<SubscriptionId>>,
}

impl SubscriptionTable {
    fn insert(&mut self, entry: Entry) {
        let id = entry.subscription.id;
        self.by_table
            .entry(entry.subscription.spec.table.clone())
            .or_default()
            .insert(id);
        self.order.push(id);
        self.by_id.insert(id, entry);
    }

    fn remove(&mut self, id: &SubscriptionId) -> Option<Entry> {
        let entry = self.by_id.remove(id)?;
        self.order.retain(|other| other != id);
        if let Some(ids) = self.by_table.get_mut(&entry.subscription.spec.table) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_table.remove(&entry.subscription.spec.table);
            }
        }
        Some(entry)
    }

    fn drain(&mut self) -> Vec<Entry> {
        let order = std::mem::take(&mut self.order);
        self.by_table.clear();
        order
            .into_iter()
            .filter_map(|id| self.by_id.remove(&id))
            .collect()
    }

    /// Update status if the entry still exists and, when given, the
    /// generation is current.
    fn set_status(
        &mut self,
        id: &SubscriptionId,
        generation: Option<u64>,
        status: SubscriptionStatus,
    ) -> bool {
        match self.by_id.get_mut(id) {
            Some(entry) if generation.map_or(true, |g| g == entry.handle.generation) => {
                entry.subscription.status = status;
                true
            }
            _ => false,
        }
    }
}

/// Stale-channel snapshot handed to the reconnection coordinator
#[derive(Clone)]
pub(crate) struct ResubscribeTarget {
    pub id: SubscriptionId,
    pub spec: SubscriptionSpec,
    pub callback: ChangeCallback,
    pub channel: ChannelRef,
}

/// Completes a channel join and records the outcome on the subscription
#[derive(Clone)]
pub(crate) struct Joiner {
    table: Arc<RwLock<SubscriptionTable>>,
    provider: Arc<dyn RealtimeProvider>,
    state: Arc<ConnectionStore>,
    telemetry: Arc<dyn TelemetrySink>,
    timeout: Duration,
}

impl Joiner {
    pub(crate) async fn run(
        self,
        id: SubscriptionId,
        channel: ChannelRef,
        generation: u64,
    ) -> RealtimeResult<()> {
        let result =
            match tokio::time::timeout(self.timeout, self.provider.subscribe_channel(&channel))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(RealtimeError::JoinTimeout(self.timeout.as_millis() as u64)),
            };

        let status = match result {
            Ok(()) => SubscriptionStatus::Subscribed,
            Err(_) => SubscriptionStatus::Error,
        };
        let current = write_table(&self.table).set_status(&id, Some(generation), status);

        match &result {
            Ok(()) if current => {
                tracing::debug!(subscription_id = %id, channel = %channel, "subscription joined");
            }
            Err(e) if current => {
                tracing::warn!(subscription_id = %id, channel = %channel, error = %e, "subscription join failed");
                self.state.record_error(e.to_string());
                self.telemetry.record(TelemetryEvent::SubscriptionFailed);
            }
            _ => {
                tracing::trace!(subscription_id = %id, generation, "discarding stale join result");
            }
        }

        result
    }
}

fn read_table(table: &RwLock<SubscriptionTable>) -> RwLockReadGuard<'_, SubscriptionTable> {
    table.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_table(table: &RwLock<SubscriptionTable>) -> RwLockWriteGuard<'_, SubscriptionTable> {
    table.write().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of active subscriptions.
///
/// The registry is the source of truth for subscription identity; a
/// [`ChannelHandle`] lives inside its registry entry and goes away with it.
pub struct SubscriptionRegistry {
    table: Arc<RwLock<SubscriptionTable>>,
    provider: Arc<dyn RealtimeProvider>,
    state: Arc<ConnectionStore>,
    telemetry: Arc<dyn TelemetrySink>,
    runtime: Handle,
    schema: String,
    join_timeout: Duration,
    next_generation: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create a registry bound to `provider`. Join handshakes are spawned on `runtime`.
    pub fn new(
        provider: Arc<dyn RealtimeProvider>,
        state: Arc<ConnectionStore>,
        telemetry: Arc<dyn TelemetrySink>,
        runtime: Handle,
        schema: impl Into<String>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            table: Arc::new(RwLock::new(SubscriptionTable::default())),
            provider,
            state,
            telemetry,
            runtime,
            schema: schema.into(),
            join_timeout,
            next_generation: AtomicU64::new(1),
        }
    }

    /// Subscribe to `event` changes on `table` in the default schema.
    ///
    /// Returns as soon as the provider channel exists; the join handshake
    /// continues in the background and moves the status to `Subscribed`
    /// or `Error`.
    pub fn subscribe(
        &self,
        table: &str,
        event: EventFilter,
        callback: ChangeCallback,
        filter: Option<RowFilter>,
    ) -> RealtimeResult<SubscriptionId> {
        let mut spec = SubscriptionSpec::new(self.schema.clone(), table, event);
        spec.filter = filter;
        self.subscribe_spec(spec, callback)
    }

    /// Subscribe with an explicit spec
    pub fn subscribe_spec(
        &self,
        spec: SubscriptionSpec,
        callback: ChangeCallback,
    ) -> RealtimeResult<SubscriptionId> {
        spec.validate()?;

        let id = SubscriptionId::new();
        let channel = match self.open_channel(id, &spec, &callback) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(table = %spec.table, error = %e, "channel open rejected");
                self.state.record_error(e.to_string());
                self.telemetry.record(TelemetryEvent::SubscriptionFailed);
                return Err(e);
            }
        };

        let generation = self.next_generation();
        let handle = ChannelHandle {
            channel: channel.clone(),
            generation,
        };
        let subscription = Subscription {
            id,
            spec,
            status: SubscriptionStatus::Unsubscribed,
            created_at: Utc::now(),
            callback,
        };

        tracing::debug!(
            subscription_id = %id,
            table = %subscription.spec.table,
            event = %subscription.spec.event,
            "subscription created"
        );
        write_table(&self.table).insert(Entry {
            subscription,
            handle,
        });
        self.telemetry.record(TelemetryEvent::SubscriptionOpened);

        let joiner = self.joiner();
        self.runtime.spawn(async move {
            let _ = joiner.run(id, channel, generation).await;
        });

        Ok(id)
    }

    /// Remove a subscription and close its channel. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let entry = write_table(&self.table).remove(id);
        match entry {
            Some(entry) => {
                self.close_quietly(&entry.handle.channel);
                self.telemetry.record(TelemetryEvent::SubscriptionClosed);
                tracing::debug!(subscription_id = %id, "subscription removed");
                true
            }
            None => false,
        }
    }

    /// Remove every subscription. Returns how many were removed.
    pub fn unsubscribe_all(&self) -> usize {
        let entries = write_table(&self.table).drain();
        for entry in &entries {
            self.close_quietly(&entry.handle.channel);
            self.telemetry.record(TelemetryEvent::SubscriptionClosed);
        }
        if !entries.is_empty() {
            tracing::debug!(count = entries.len(), "all subscriptions removed");
        }
        entries.len()
    }

    /// Get subscription count
    pub fn len(&self) -> usize {
        read_table(&self.table).by_id.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &SubscriptionId) -> bool {
        read_table(&self.table).by_id.contains_key(id)
    }

    /// Subscription ids in registration order
    pub fn ids(&self) -> Vec<SubscriptionId> {
        read_table(&self.table).order.clone()
    }

    pub fn status(&self, id: &SubscriptionId) -> Option<SubscriptionStatus> {
        read_table(&self.table)
            .by_id
            .get(id)
            .map(|entry| entry.subscription.status)
    }

    pub fn get(&self, id: &SubscriptionId) -> Option<Subscription> {
        read_table(&self.table)
            .by_id
            .get(id)
            .map(|entry| entry.subscription.clone())
    }

    /// Current provider channel binding of a subscription
    pub fn handle(&self, id: &SubscriptionId) -> Option<ChannelHandle> {
        read_table(&self.table)
            .by_id
            .get(id)
            .map(|entry| entry.handle.clone())
    }

    /// Ids of subscriptions on `table`
    pub fn subscriptions_for_table(&self, table: &str) -> Vec<SubscriptionId> {
        let guard = read_table(&self.table);
        let Some(ids) = guard.by_table.get(table) else {
            return Vec::new();
        };
        guard
            .order
            .iter()
            .filter(|id| ids.contains(*id))
            .copied()
            .collect()
    }

    // Reconnection support

    pub(crate) fn snapshot(&self) -> Vec<ResubscribeTarget> {
        let guard = read_table(&self.table);
        guard
            .order
            .iter()
            .filter_map(|id| guard.by_id.get(id))
            .map(|entry| ResubscribeTarget {
                id: entry.subscription.id,
                spec: entry.subscription.spec.clone(),
                callback: entry.subscription.callback.clone(),
                channel: entry.handle.channel.clone(),
            })
            .collect()
    }

    /// Open a provider channel forwarding to `callback`
    pub(crate) fn open_channel(
        &self,
        id: SubscriptionId,
        spec: &SubscriptionSpec,
        callback: &ChangeCallback,
    ) -> RealtimeResult<ChannelRef> {
        let sink = self.sink_for(id, callback.clone());
        self.provider
            .open_channel(&spec.channel_name(id), &spec.channel_spec(), sink)
    }

    /// Point a subscription at a fresh channel. `None` when the
    /// subscription was removed in the meantime.
    pub(crate) fn rebind(&self, id: &SubscriptionId, channel: ChannelRef) -> Option<u64> {
        let generation = self.next_generation();
        let mut guard = write_table(&self.table);
        let entry = guard.by_id.get_mut(id)?;
        entry.handle = ChannelHandle {
            channel,
            generation,
        };
        entry.subscription.status = SubscriptionStatus::Unsubscribed;
        Some(generation)
    }

    pub(crate) fn mark_failed(&self, id: &SubscriptionId) {
        write_table(&self.table).set_status(id, None, SubscriptionStatus::Error);
    }

    pub(crate) fn close_quietly(&self, channel: &ChannelRef) {
        if let Err(e) = self.provider.close_channel(channel) {
            tracing::debug!(channel = %channel, error = %e, "ignoring channel close failure");
        }
    }

    pub(crate) fn joiner(&self) -> Joiner {
        Joiner {
            table: Arc::clone(&self.table),
            provider: Arc::clone(&self.provider),
            state: Arc::clone(&self.state),
            telemetry: Arc::clone(&self.telemetry),
            timeout: self.join_timeout,
        }
    }

    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn sink_for(&self, id: SubscriptionId, callback: ChangeCallback) -> ChannelSink {
        let telemetry = Arc::clone(&self.telemetry);
        Arc::new(move |message: ChannelMessage| match message {
            ChannelMessage::Change(event) => {
                telemetry.record(TelemetryEvent::EventDelivered);
                callback(event);
            }
            ChannelMessage::Presence { .. } => {
                tracing::trace!(subscription_id = %id, "ignoring presence message on change channel");
            }
        })
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("schema", &self.schema)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
