//! Client-side error types.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single `connect()` attempt.
///
/// `Timeout` and `Transport` are recoverable: the manager schedules a
/// reconnect on its own when auto-reconnect is enabled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// `disconnect()` or `destroy()` was called while the attempt was in flight.
    #[error("connection attempt aborted")]
    Aborted,

    #[error("connection manager has been destroyed")]
    Destroyed,
}

/// Rejection of a single `send()` call. Never affects connection state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("rate limit exceeded: at most {limit} messages per minute")]
    RateLimitExceeded { limit: u32 },

    #[error("outbound queue is full ({capacity} messages)")]
    QueueFull { capacity: usize },

    #[error("connection manager has been destroyed")]
    Destroyed,
}

/// Failure reported by a [`Transport`](crate::Transport) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<TransportError> for ConnectError {
    fn from(err: TransportError) -> Self {
        ConnectError::Transport(err.0)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("environment variable {name} has invalid value '{value}'")]
    InvalidVar { name: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
