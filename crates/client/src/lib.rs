//! Livechat client - realtime connection runtime
//!
//! This crate keeps a chat widget's realtime link alive (reconnect with
//! backoff, heartbeat, offline queue, rate limiting) and fans server change
//! notifications out to local subscribers.

pub mod config;
pub mod error;
pub mod timer;
pub mod ws;

pub use config::ConnectionConfig;
pub use error::{ConfigError, ConnectError, SendError, TransportError};
pub use timer::{Timer, TokioTimer};
pub use ws::*;
