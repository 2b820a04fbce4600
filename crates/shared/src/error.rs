//! Protocol-level error types.

use thiserror::Error;

/// Errors produced while encoding or decoding wire envelopes.
///
/// These never cross into subscriber code: the connection layer logs them and
/// drops the offending frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope of type '{kind}' is missing its payload")]
    MissingPayload { kind: String },

    #[error("unknown change event '{0}'")]
    UnknownEvent(String),

    #[error("invalid filter '{0}', expected field=value")]
    InvalidFilter(String),
}
