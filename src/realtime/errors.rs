//! # Real-Time Errors
//!
//! Error types for the real-time module.

use thiserror::Error;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Real-time errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    // ==================
    // Connection Errors
    // ==================
    /// Connection timeout
    #[error("Connection timeout after {0} ms")]
    ConnectionTimeout(u64),

    /// Provider link could not be (re-)established
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    // ==================
    // Subscription Errors
    // ==================
    /// Invalid topic format
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Provider refused to create a channel
    #[error("Channel open failed: {0}")]
    ChannelOpen(String),

    /// Channel join handshake failed
    #[error("Channel join failed: {0}")]
    ChannelJoin(String),

    /// Channel join handshake timed out
    #[error("Channel join timed out after {0} ms")]
    JoinTimeout(u64),

    /// Malformed row filter expression
    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    /// Payload could not be decoded into the declared row type
    #[error("Payload decode failed: {0}")]
    Decode(String),

    // ==================
    // Presence Errors
    // ==================
    /// Not tracking presence
    #[error("Not tracking presence in this channel")]
    NotTracking,

    // ==================
    // Setup Errors
    // ==================
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Called outside of a tokio runtime
    #[error("No tokio runtime available")]
    NoRuntime,
}

impl RealtimeError {
    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::ConnectionTimeout(_)
                | RealtimeError::ConnectionError(_)
                | RealtimeError::ChannelJoin(_)
                | RealtimeError::JoinTimeout(_)
        )
    }
}
