//! Realtime layer: one managed connection, many subscribers.
//!
//! This module provides:
//! - Connection management with auto-reconnect, heartbeat and an offline queue
//! - A subscription multiplexer that shares one server subscription per channel
//! - Typed feeds for the widget's message, session and config streams
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 ConnectionManager                   │
//! │   (state machine, backoff, heartbeat, send queue)   │
//! └─────────────────────────────────────────────────────┘
//!                │ on_message / on_connect
//!                ▼
//!     ┌────────────────────────┐
//!     │ SubscriptionMultiplexer│
//!     │  ChannelKey → callbacks│
//!     └────────────────────────┘
//!                │
//!     ┌──────────┼───────────────┐
//!     ▼          ▼               ▼
//! ┌────────┐ ┌──────────┐ ┌─────────────┐
//! │messages│ │ sessions │ │widget config│
//! │ (S1)   │ │ (S1)     │ │  listener   │
//! └────────┘ └──────────┘ └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let connection = ConnectionManager::new(ConnectionConfig::from_env()?);
//! let mux = SubscriptionMultiplexer::new(connection.clone());
//!
//! let sub = mux.watch(&Feed::SessionMessages { session_id }, |event| {
//!     println!("new message: {}", event.new);
//! });
//! connection.connect().await?;
//! // ...
//! sub.unsubscribe();
//! connection.destroy();
//! ```

mod connection;
mod feeds;
mod multiplexer;

pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStats, Frame, HandlerId, OutboundQueue,
    RateWindow, ReconnectPolicy, Transport, TransportEvent, TransportLink, WsTransport,
    CLOSE_NORMAL, RATE_WINDOW,
};
pub use feeds::{Feed, MESSAGES, SESSIONS, WIDGET_CONFIGS};
pub use multiplexer::{ChangeEvent, ChangeStream, Subscription, SubscriptionMultiplexer};

/// Best-effort text of a caught panic, for logging.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
