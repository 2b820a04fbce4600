//! Duplex transport boundary.
//!
//! The connection manager only needs to open a link, push text frames into
//! it, and read what comes back. Anything that can carry text frames both ways
//! (WebSocket, TCP with framing, an in-memory pair in tests) fits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// WebSocket close code for a normal, intentional close.
pub const CLOSE_NORMAL: u16 = 1000;

/// Frame written by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

impl Frame {
    pub fn close_normal(reason: impl Into<String>) -> Self {
        Frame::Close {
            code: CLOSE_NORMAL,
            reason: reason.into(),
        }
    }
}

/// Something that happened on the remote side of an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// An open link. Dropping `outbound` closes the write side.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a new link to `url`. Resolves once the link is usable.
    async fn open(&self, url: &str) -> Result<TransportLink, TransportError>;
}
