//! dossier-realtime - live table subscriptions and connection management
//! for the dossier workspace

pub mod cli;
pub mod realtime;

pub use realtime::{
    ChangeEvent, ConnectionStatus, EventFilter, EventType, RealtimeClient, RealtimeConfig,
    RealtimeError, RealtimeProvider, RealtimeResult, RowFilter, SubscriptionId,
};
