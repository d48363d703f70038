//! # Presence Tracking
//!
//! Who else is looking at the same thing. Each tracked channel holds one
//! provider presence channel keyed by an ephemeral session id.
//!
//! Presence is eventually consistent: the local view is replaced wholesale
//! on every provider `sync`, never patched from `join`/`leave` diffs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use super::errors::{RealtimeError, RealtimeResult};
use super::event::PresenceEventType;
use super::provider::{
    ChannelMessage, ChannelRef, ChannelSink, ChannelSpec, PresenceSnapshot, RealtimeProvider,
};
use super::state::ConnectionStore;
use super::telemetry::{TelemetryEvent, TelemetrySink};

/// Local view of one presence channel
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PresenceView {
    /// Members keyed by session id
    pub presence: PresenceSnapshot,
    /// Whether this session has joined and announced itself
    pub is_online: bool,
}

/// Observer for one tracked presence channel
#[derive(Debug, Clone)]
pub struct PresenceHandle {
    channel: String,
    session_id: String,
    rx: watch::Receiver<PresenceView>,
}

impl PresenceHandle {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Ephemeral id this session announced itself with
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn presence(&self) -> PresenceSnapshot {
        self.rx.borrow().presence.clone()
    }

    pub fn is_online(&self) -> bool {
        self.rx.borrow().is_online
    }

    pub fn view(&self) -> PresenceView {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new view.
    ///
    /// Fails with `NotTracking` once the tracker is gone.
    pub async fn changed(&mut self) -> RealtimeResult<PresenceView> {
        self.rx
            .changed()
            .await
            .map_err(|_| RealtimeError::NotTracking)?;
        Ok(self.rx.borrow_and_update().clone())
    }
}

struct PresenceChannel {
    channel: ChannelRef,
    session_id: String,
    view: Arc<watch::Sender<PresenceView>>,
}

impl PresenceChannel {
    fn handle(&self, name: &str) -> PresenceHandle {
        PresenceHandle {
            channel: name.to_string(),
            session_id: self.session_id.clone(),
            rx: self.view.subscribe(),
        }
    }
}

/// Joins a presence channel, then announces the local session
#[derive(Clone)]
struct Announcer {
    provider: Arc<dyn RealtimeProvider>,
    state: Arc<ConnectionStore>,
    timeout: Duration,
}

impl Announcer {
    async fn run(
        self,
        channel: ChannelRef,
        session_id: String,
        view: Arc<watch::Sender<PresenceView>>,
    ) -> RealtimeResult<()> {
        let joined =
            match tokio::time::timeout(self.timeout, self.provider.subscribe_channel(&channel))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(RealtimeError::JoinTimeout(self.timeout.as_millis() as u64)),
            };

        let result = match joined {
            Ok(()) => {
                let metadata = json!({
                    "session_id": session_id,
                    "online_at": Utc::now().to_rfc3339(),
                });
                self.provider.track(&channel, metadata).await
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(()) => {
                view.send_modify(|v| v.is_online = true);
                tracing::debug!(channel = %channel, session_id = %session_id, "presence announced");
            }
            Err(e) => {
                view.send_modify(|v| v.is_online = false);
                tracing::warn!(channel = %channel, error = %e, "presence join failed");
                self.state.record_error(e.to_string());
            }
        }

        result
    }
}

/// Presence channels tracked by one client
pub struct PresenceTracker {
    provider: Arc<dyn RealtimeProvider>,
    state: Arc<ConnectionStore>,
    telemetry: Arc<dyn TelemetrySink>,
    runtime: Handle,
    join_timeout: Duration,
    channels: RwLock<HashMap<String, PresenceChannel>>,
}

impl PresenceTracker {
    pub fn new(
        provider: Arc<dyn RealtimeProvider>,
        state: Arc<ConnectionStore>,
        telemetry: Arc<dyn TelemetrySink>,
        runtime: Handle,
        join_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            state,
            telemetry,
            runtime,
            join_timeout,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Track presence on `name`.
    ///
    /// Tracking a channel that is already tracked returns another handle
    /// onto the same provider channel.
    pub fn track(&self, name: &str) -> RealtimeResult<PresenceHandle> {
        if name.trim().is_empty() {
            return Err(RealtimeError::InvalidTopic(
                "presence channel name is empty".into(),
            ));
        }

        let mut channels = self.write_channels();

        if let Some(existing) = channels.get(name) {
            return Ok(existing.handle(name));
        }

        let session_id = Uuid::new_v4().to_string();
        let (tx, _) = watch::channel(PresenceView::default());
        let view = Arc::new(tx);
        let channel = self.open(name, &session_id, &view)?;

        let entry = PresenceChannel {
            channel: channel.clone(),
            session_id: session_id.clone(),
            view: Arc::clone(&view),
        };
        let handle = entry.handle(name);
        channels.insert(name.to_string(), entry);
        drop(channels);

        tracing::info!(channel = name, session_id = %session_id, "tracking presence");
        self.runtime
            .spawn(self.announcer().run(channel, session_id, view));

        Ok(handle)
    }

    /// Stop tracking `name`. Returns false when it was not tracked.
    pub fn untrack(&self, name: &str) -> bool {
        let removed = self.write_channels().remove(name);

        match removed {
            Some(entry) => {
                self.release(entry);
                tracing::info!(channel = name, "presence untracked");
                true
            }
            None => false,
        }
    }

    /// Stop tracking every channel
    pub fn untrack_all(&self) -> usize {
        let drained: Vec<PresenceChannel> = self
            .write_channels()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let count = drained.len();
        for entry in drained {
            self.release(entry);
        }
        count
    }

    /// Replace every presence channel after a reconnect.
    ///
    /// Session ids survive. Returns how many channels rejoined.
    pub async fn rejoin_all(&self) -> usize {
        let targets: Vec<(String, String, ChannelRef, Arc<watch::Sender<PresenceView>>)> = self
            .read_channels()
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    entry.session_id.clone(),
                    entry.channel.clone(),
                    Arc::clone(&entry.view),
                )
            })
            .collect();

        let mut joins = Vec::with_capacity(targets.len());
        for (name, session_id, stale, view) in targets {
            if let Err(e) = self.provider.close_channel(&stale) {
                tracing::debug!(channel = %stale, error = %e, "closing stale presence channel failed");
            }
            view.send_modify(|v| v.is_online = false);

            let channel = match self.open(&name, &session_id, &view) {
                Ok(channel) => channel,
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "presence reopen failed");
                    self.state.record_error(e.to_string());
                    continue;
                }
            };

            let current = {
                let mut channels = self.write_channels();
                match channels.get_mut(&name) {
                    Some(entry) if entry.session_id == session_id => {
                        entry.channel = channel.clone();
                        true
                    }
                    _ => false,
                }
            };
            if !current {
                let _ = self.provider.close_channel(&channel);
                continue;
            }

            joins.push(self.announcer().run(channel, session_id, view));
        }

        join_all(joins)
            .await
            .into_iter()
            .filter(|result| result.is_ok())
            .count()
    }

    /// Handle onto an already tracked channel
    pub fn handle(&self, name: &str) -> Option<PresenceHandle> {
        self.read_channels()
            .get(name)
            .map(|entry| entry.handle(name))
    }

    /// Get count of tracked channels
    pub fn count(&self) -> usize {
        self.read_channels().len()
    }

    /// Check if a channel is tracked
    pub fn is_tracked(&self, name: &str) -> bool {
        self.read_channels().contains_key(name)
    }

    // Entries are swapped in and out whole, so a poisoned map is still
    // consistent.
    fn read_channels(&self) -> RwLockReadGuard<'_, HashMap<String, PresenceChannel>> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_channels(&self) -> RwLockWriteGuard<'_, HashMap<String, PresenceChannel>> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(
        &self,
        name: &str,
        session_id: &str,
        view: &Arc<watch::Sender<PresenceView>>,
    ) -> RealtimeResult<ChannelRef> {
        let spec = ChannelSpec::Presence {
            key: session_id.to_string(),
        };
        self.provider.open_channel(name, &spec, self.sink_for(view))
    }

    fn release(&self, entry: PresenceChannel) {
        if let Err(e) = self.provider.close_channel(&entry.channel) {
            tracing::debug!(channel = %entry.channel, error = %e, "closing presence channel failed");
        }
        entry.view.send_modify(|v| {
            v.presence.clear();
            v.is_online = false;
        });
    }

    fn announcer(&self) -> Announcer {
        Announcer {
            provider: Arc::clone(&self.provider),
            state: Arc::clone(&self.state),
            timeout: self.join_timeout,
        }
    }

    fn sink_for(&self, view: &Arc<watch::Sender<PresenceView>>) -> ChannelSink {
        // The provider owns the sink; hold it weakly.
        let provider = Arc::downgrade(&self.provider);
        let telemetry = Arc::clone(&self.telemetry);
        let view = Arc::clone(view);

        Arc::new(move |message: ChannelMessage| match message {
            ChannelMessage::Presence {
                event: PresenceEventType::Sync,
                channel,
            } => {
                let Some(provider) = provider.upgrade() else {
                    return;
                };
                match provider.presence_state(&channel) {
                    Ok(presence) => {
                        view.send_modify(|v| v.presence = presence);
                        telemetry.record(TelemetryEvent::PresenceSynced);
                    }
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "presence state read failed");
                    }
                }
            }
            ChannelMessage::Presence { event, channel } => {
                tracing::trace!(channel = %channel, event = ?event, "presence diff");
            }
            ChannelMessage::Change(_) => {
                tracing::trace!("ignoring change message on presence channel");
            }
        })
    }
}

impl fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("count", &self.count())
            .finish_non_exhaustive()
    }
}
