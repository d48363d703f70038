//! # Real-Time Events
//!
//! Change events delivered by the provider, and the filters that select them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{RealtimeError, RealtimeResult};

/// Type of database event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// New record inserted
    Insert,
    /// Existing record updated
    Update,
    /// Record deleted
    Delete,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for EventType {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(EventType::Insert),
            "UPDATE" => Ok(EventType::Update),
            "DELETE" => Ok(EventType::Delete),
            other => Err(RealtimeError::InvalidMessage(format!(
                "unknown event type '{}'",
                other
            ))),
        }
    }
}

/// Which events a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    /// `*`
    #[default]
    All,
    Only(EventType),
}

impl EventFilter {
    pub fn accepts(&self, event: EventType) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(expected) => *expected == event,
        }
    }
}

impl From<EventType> for EventFilter {
    fn from(event: EventType) -> Self {
        EventFilter::Only(event)
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::All => write!(f, "*"),
            EventFilter::Only(event) => write!(f, "{}", event),
        }
    }
}

impl FromStr for EventFilter {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            Ok(EventFilter::All)
        } else {
            s.parse().map(EventFilter::Only)
        }
    }
}

impl Serialize for EventFilter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EventFilter {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// A data change delivered on a subscription.
///
/// `T` is the declared row type; untyped subscriptions use `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent<T = Value> {
    /// Event type
    pub event: EventType,

    /// Schema name (default: "public")
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Table the change happened on
    pub table: String,

    /// Row filter the channel was opened with, in wire form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,

    /// New row for INSERT/UPDATE, removed row for DELETE
    pub data: T,

    /// Previous row for UPDATE/DELETE when the provider sends it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old: Option<Value>,

    /// Commit timestamp reported by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_timestamp: Option<DateTime<Utc>>,
}

fn default_schema() -> String {
    "public".to_string()
}

impl ChangeEvent<Value> {
    /// Create an event on the default schema
    pub fn new(event: EventType, table: impl Into<String>, data: Value) -> Self {
        Self {
            event,
            schema: default_schema(),
            table: table.into(),
            filter: None,
            data,
            old: None,
            commit_timestamp: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_old(mut self, old: Value) -> Self {
        self.old = Some(old);
        self
    }

    pub fn with_commit_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.commit_timestamp = Some(at);
        self
    }

    /// Decode the row payload into a declared row type
    pub fn decode<T: DeserializeOwned>(self) -> RealtimeResult<ChangeEvent<T>> {
        let data = serde_json::from_value(self.data)
            .map_err(|e| RealtimeError::Decode(format!("{}.{}: {}", self.schema, self.table, e)))?;
        Ok(ChangeEvent {
            event: self.event,
            schema: self.schema,
            table: self.table,
            filter: self.filter,
            data,
            old: self.old,
            commit_timestamp: self.commit_timestamp,
        })
    }

    /// Decode a `postgres_changes` envelope as sent by the provider
    pub fn from_wire(message: &Value) -> RealtimeResult<Self> {
        if message.get("type").and_then(Value::as_str) != Some("postgres_changes") {
            return Err(RealtimeError::InvalidMessage(
                "expected a postgres_changes message".into(),
            ));
        }
        let payload = message
            .get("payload")
            .ok_or_else(|| RealtimeError::InvalidMessage("missing payload".into()))?;

        let event: EventType = payload
            .get("event")
            .and_then(Value::as_str)
            .ok_or_else(|| RealtimeError::InvalidMessage("missing event".into()))?
            .parse()?;
        let table = payload
            .get("table")
            .and_then(Value::as_str)
            .ok_or_else(|| RealtimeError::InvalidMessage("missing table".into()))?;
        let schema = payload
            .get("schema")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(default_schema);

        let new = payload.get("new").filter(|v| !is_empty_row(v)).cloned();
        let old = payload.get("old").filter(|v| !is_empty_row(v)).cloned();
        let data = match event {
            EventType::Delete => old.clone().or(new).unwrap_or(Value::Null),
            _ => new.or_else(|| old.clone()).unwrap_or(Value::Null),
        };

        let commit_timestamp = payload
            .get("commit_timestamp")
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        Ok(Self {
            event,
            schema,
            table: table.to_string(),
            filter: payload
                .get("filter")
                .and_then(Value::as_str)
                .map(str::to_string),
            data,
            old: if event == EventType::Insert { None } else { old },
            commit_timestamp,
        })
    }

    /// Serialize to the provider's `postgres_changes` envelope
    pub fn to_wire_format(&self) -> Value {
        let (new, old) = match self.event {
            EventType::Delete => (Value::Null, self.data.clone()),
            _ => (
                self.data.clone(),
                self.old.clone().unwrap_or(Value::Null),
            ),
        };
        serde_json::json!({
            "type": "postgres_changes",
            "payload": {
                "event": self.event.to_string(),
                "schema": self.schema,
                "table": self.table,
                "filter": self.filter,
                "new": new,
                "old": old,
                "commit_timestamp": self.commit_timestamp.map(|t| t.to_rfc3339()),
            }
        })
    }
}

fn is_empty_row(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Type of presence event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceEventType {
    Join,
    Leave,
    Sync,
}
