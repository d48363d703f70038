//! # Connection State
//!
//! The coarse connection status shared by the monitor, the reconnection
//! coordinator and every consumer. One `ConnectionStore` per client
//! instance; consumers read it through `watch` receivers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Coarse connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Observable connection state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl ConnectionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Owner of the connection state.
///
/// Writers are crate-private: only the monitor and the reconnection
/// coordinator move the status.
#[derive(Debug)]
pub struct ConnectionStore {
    tx: watch::Sender<ConnectionSnapshot>,
}

impl Default for ConnectionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStore {
    /// Starts `disconnected` with no error
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionSnapshot {
            status: ConnectionStatus::Disconnected,
            last_error: None,
            changed_at: Utc::now(),
        });
        Self { tx }
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.tx.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.tx.borrow().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn last_error(&self) -> Option<String> {
        self.tx.borrow().last_error.clone()
    }

    /// Receiver notified on every change
    pub fn watch(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.tx.subscribe()
    }

    /// Move to `status`. Entering `connected` clears the recorded error.
    /// Returns whether anything changed.
    pub(crate) fn set_status(&self, status: ConnectionStatus) -> bool {
        self.tx.send_if_modified(|snapshot| {
            let clear_error = status == ConnectionStatus::Connected && snapshot.last_error.is_some();
            if snapshot.status == status && !clear_error {
                return false;
            }
            snapshot.status = status;
            if status == ConnectionStatus::Connected {
                snapshot.last_error = None;
            }
            snapshot.changed_at = Utc::now();
            true
        })
    }

    /// Move to `error` and record the message
    pub(crate) fn set_error(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        self.tx.send_if_modified(|snapshot| {
            if snapshot.status == ConnectionStatus::Error
                && snapshot.last_error.as_deref() == Some(message.as_str())
            {
                return false;
            }
            snapshot.status = ConnectionStatus::Error;
            snapshot.last_error = Some(message);
            snapshot.changed_at = Utc::now();
            true
        })
    }

    /// Record an error without touching the status
    pub(crate) fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_modify(|snapshot| {
            snapshot.last_error = Some(message);
        });
    }
}
