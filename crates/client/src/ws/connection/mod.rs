//! Realtime connection with state management and auto-reconnect.
//!
//! This module provides the shared types (state machine, backoff policy) and
//! the pieces the [`ConnectionManager`] is assembled from.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;

use crate::config::ConnectionConfig;

mod manager;
mod queue;
mod rate_limit;
mod transport;
mod transport_native;

pub use manager::{ConnectionManager, ConnectionStats, HandlerId};
pub use queue::OutboundQueue;
pub use rate_limit::{RateWindow, RATE_WINDOW};
pub use transport::{Frame, Transport, TransportEvent, TransportLink, CLOSE_NORMAL};
pub use transport_native::WsTransport;

/// Connection state for the realtime link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting { .. } => "reconnecting",
            ConnectionState::Failed { .. } => "failed",
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Every path into `Connected` goes through `Connecting`, and only an
    /// explicit disconnect leads back to `Disconnected`.
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed { .. })
                | (Connecting, Disconnected)
                | (Connected, Reconnecting { .. })
                | (Connected, Failed { .. })
                | (Connected, Disconnected)
                | (Reconnecting { .. }, Connecting)
                | (Reconnecting { .. }, Disconnected)
                | (Failed { .. }, Reconnecting { .. })
                | (Failed { .. }, Connecting)
                | (Failed { .. }, Disconnected)
        )
    }
}

pub const INITIAL_RECONNECT_DELAY_MS: u64 = 1_000;
pub const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
pub const MAX_RECONNECT_JITTER: f64 = 0.1;

/// Exponential backoff for reconnect attempts
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts allowed before the connection is declared failed
    pub max_attempts: u32,
    /// Delay before the first attempt in milliseconds
    pub initial_delay_ms: u64,
    /// Cap on the un-jittered delay in milliseconds
    pub max_delay_ms: u64,
    /// Upper bound of the random jitter, as a fraction of the delay
    pub max_jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: crate::config::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            initial_delay_ms: INITIAL_RECONNECT_DELAY_MS,
            max_delay_ms: MAX_RECONNECT_DELAY_MS,
            max_jitter: MAX_RECONNECT_JITTER,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        Self {
            max_attempts: config.max_reconnect_attempts,
            ..Self::default()
        }
    }

    /// Un-jittered delay for a 1-indexed attempt: `initial * 2^(attempt-1)`, capped.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Delay with an explicit jitter sample in `[0.0, 1.0)`.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_with_jitter(&self, attempt: u32, sample: f64) -> Duration {
        let base = self.base_delay(attempt).as_millis() as u64;
        let jitter = (base as f64 * self.max_jitter * sample.clamp(0.0, 1.0)) as u64;
        Duration::from_millis(base + jitter)
    }

    /// Calculate the delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen();
        self.delay_with_jitter(attempt, sample)
    }
}
