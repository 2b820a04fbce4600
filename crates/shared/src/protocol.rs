//! Wire envelope definitions.
//!
//! Every frame on the realtime connection is a JSON object of the form
//!
//! ```text
//! { "type": "...", "payload": ..., "timestamp": "...", "clientId": "...", "sentAt": "..." }
//! ```
//!
//! The `type` tag selects the [`Payload`] variant. Types outside the fixed
//! vocabulary are preserved as [`Payload::Custom`] so application code can
//! layer its own messages on the same connection.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::models::{ChangeKind, ChannelKey, Filter};

/// Type tags of the fixed envelope vocabulary.
pub mod kind {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const CHANGE: &str = "change";
    pub const DATA: &str = "data";
    pub const ERROR: &str = "error";
}

/// Payload of SUBSCRIBE and UNSUBSCRIBE frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTarget {
    pub resource: String,
    pub event: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
}

impl From<&ChannelKey> for SubscriptionTarget {
    fn from(key: &ChannelKey) -> Self {
        Self {
            resource: key.resource.clone(),
            event: key.event,
            filter: key.filter.clone(),
        }
    }
}

impl From<SubscriptionTarget> for ChannelKey {
    fn from(target: SubscriptionTarget) -> Self {
        Self {
            resource: target.resource,
            event: target.event,
            filter: target.filter,
        }
    }
}

/// Payload of a CHANGE frame pushed by the server.
///
/// `event` is kept as the raw string so an unknown event name does not make
/// the whole frame unreadable; routing decides what to do with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub resource: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ChangeNotification {
    pub fn new(resource: impl Into<String>, event: ChangeKind, data: Value) -> Self {
        Self {
            resource: resource.into(),
            event: event.to_string(),
            data,
        }
    }
}

/// Payload of an ERROR frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

/// Tagged union over the envelope vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Ping,
    Pong,
    Subscribe(SubscriptionTarget),
    Unsubscribe(SubscriptionTarget),
    Change(ChangeNotification),
    Data(Value),
    Error(ErrorPayload),
    /// Application-defined message type.
    Custom { kind: String, body: Option<Value> },
}

impl Payload {
    /// The wire `type` tag for this payload.
    pub fn kind(&self) -> &str {
        match self {
            Payload::Ping => kind::PING,
            Payload::Pong => kind::PONG,
            Payload::Subscribe(_) => kind::SUBSCRIBE,
            Payload::Unsubscribe(_) => kind::UNSUBSCRIBE,
            Payload::Change(_) => kind::CHANGE,
            Payload::Data(_) => kind::DATA,
            Payload::Error(_) => kind::ERROR,
            Payload::Custom { kind, .. } => kind,
        }
    }

    pub fn custom(kind: impl Into<String>, body: Value) -> Self {
        Payload::Custom {
            kind: kind.into(),
            body: Some(body),
        }
    }
}

/// One unit exchanged over the transport.
///
/// Envelopes are immutable: fields are read through accessors and the only
/// "modifier", [`Envelope::stamped`], consumes the envelope and returns a new one.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    payload: Payload,
    timestamp: DateTime<Utc>,
    client_id: String,
    sent_at: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Build an envelope stamped with the current time and no client id.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            client_id: String::new(),
            sent_at: None,
        }
    }

    /// Heartbeat ping carrying its own send time.
    pub fn ping(sent_at: DateTime<Utc>) -> Self {
        Self {
            sent_at: Some(sent_at),
            ..Self::new(Payload::Ping)
        }
    }

    /// Heartbeat reply echoing the ping's send time.
    pub fn pong(sent_at: Option<DateTime<Utc>>) -> Self {
        Self {
            sent_at,
            ..Self::new(Payload::Pong)
        }
    }

    pub fn subscribe(key: &ChannelKey) -> Self {
        Self::new(Payload::Subscribe(key.into()))
    }

    pub fn unsubscribe(key: &ChannelKey) -> Self {
        Self::new(Payload::Unsubscribe(key.into()))
    }

    pub fn change(notification: ChangeNotification) -> Self {
        Self::new(Payload::Change(notification))
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> &str {
        self.payload.kind()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    /// Fill in the sender identity if the envelope does not carry one yet.
    pub fn stamped(self, client_id: &str) -> Self {
        if self.client_id.is_empty() {
            Self {
                client_id: client_id.to_string(),
                ..self
            }
        } else {
            self
        }
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawEnvelope = serde_json::from_str(text)?;
        Envelope::try_from(raw)
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<Payload> for Envelope {
    fn from(payload: Payload) -> Self {
        Envelope::new(payload)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let has_body = !matches!(
            self.payload,
            Payload::Ping | Payload::Pong | Payload::Custom { body: None, .. }
        );
        let len = 3 + usize::from(has_body) + usize::from(self.sent_at.is_some());

        let mut state = serializer.serialize_struct("Envelope", len)?;
        state.serialize_field("type", self.payload.kind())?;
        match &self.payload {
            Payload::Ping | Payload::Pong | Payload::Custom { body: None, .. } => {}
            Payload::Subscribe(target) | Payload::Unsubscribe(target) => {
                state.serialize_field("payload", target)?
            }
            Payload::Change(change) => state.serialize_field("payload", change)?,
            Payload::Data(value) => state.serialize_field("payload", value)?,
            Payload::Error(error) => state.serialize_field("payload", error)?,
            Payload::Custom {
                body: Some(body), ..
            } => state.serialize_field("payload", body)?,
        }
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("clientId", &self.client_id)?;
        if let Some(sent_at) = &self.sent_at {
            state.serialize_field("sentAt", sent_at)?;
        }
        state.end()
    }
}

/// Loosely-typed wire form, validated into [`Envelope`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default)]
    client_id: String,
    #[serde(default)]
    sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = ProtocolError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        fn required<T: serde::de::DeserializeOwned>(
            kind: &str,
            payload: Option<Value>,
        ) -> Result<T, ProtocolError> {
            let value = payload.ok_or_else(|| ProtocolError::MissingPayload {
                kind: kind.to_string(),
            })?;
            Ok(serde_json::from_value(value)?)
        }

        let mut sent_at = raw.sent_at;
        let tag = raw.kind.to_ascii_lowercase();
        let payload = match tag.as_str() {
            kind::PING => Payload::Ping,
            kind::PONG => {
                // Some servers echo the ping time inside the payload instead.
                if sent_at.is_none() {
                    sent_at = raw
                        .payload
                        .as_ref()
                        .and_then(|p| p.get("sentAt"))
                        .and_then(Value::as_str)
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|dt| dt.with_timezone(&Utc));
                }
                Payload::Pong
            }
            kind::SUBSCRIBE => Payload::Subscribe(required(&tag, raw.payload)?),
            kind::UNSUBSCRIBE => Payload::Unsubscribe(required(&tag, raw.payload)?),
            kind::CHANGE => Payload::Change(required(&tag, raw.payload)?),
            kind::DATA => Payload::Data(raw.payload.unwrap_or(Value::Null)),
            kind::ERROR => Payload::Error(required(&tag, raw.payload)?),
            _ => Payload::Custom {
                kind: raw.kind,
                body: raw.payload,
            },
        };

        Ok(Self {
            payload,
            timestamp: raw.timestamp,
            client_id: raw.client_id,
            sent_at,
        })
    }
}
