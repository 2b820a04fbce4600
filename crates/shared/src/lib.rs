//! Shared wire types for the livechat realtime layer.
//!
//! Both the client runtime and any server speaking the same protocol depend on
//! these definitions: the [`Envelope`] exchanged over the transport, its
//! [`Payload`] vocabulary, and the structured [`ChannelKey`] that identifies a
//! logical subscription.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
