//! Subscription identity types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Kind of row change a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            _ => Err(ProtocolError::UnknownEvent(s.to_string())),
        }
    }
}

/// Client-side equality filter on one field of a change's row data.
///
/// On the wire a filter travels as the string `field=value`; only the first
/// `=` separates the two halves, so values may themselves contain `=`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Filter {
    pub field: String,
    pub value: String,
}

impl Filter {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Check a change's row data against this filter.
    ///
    /// Only string fields can match; a numeric `5` does not satisfy `n=5`.
    pub fn matches(&self, data: &Value) -> bool {
        data.get(&self.field)
            .and_then(Value::as_str)
            .is_some_and(|v| v == self.value)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.value)
    }
}

impl FromStr for Filter {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (field, value) = s
            .split_once('=')
            .ok_or_else(|| ProtocolError::InvalidFilter(s.to_string()))?;
        let field = field.trim();
        if field.is_empty() {
            return Err(ProtocolError::InvalidFilter(s.to_string()));
        }
        Ok(Filter::new(field, value))
    }
}

impl TryFrom<String> for Filter {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Filter> for String {
    fn from(filter: Filter) -> Self {
        filter.to_string()
    }
}

/// Identity of one logical subscription target.
///
/// Keys are compared structurally, so a resource named `chat-sessions` or a
/// filter value containing `-` never collides with another key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub resource: String,
    pub event: ChangeKind,
    pub filter: Option<Filter>,
}

impl ChannelKey {
    pub fn new(resource: impl Into<String>, event: ChangeKind) -> Self {
        Self {
            resource: resource.into(),
            event,
            filter: None,
        }
    }

    pub fn filtered(resource: impl Into<String>, event: ChangeKind, filter: Filter) -> Self {
        Self {
            resource: resource.into(),
            event,
            filter: Some(filter),
        }
    }

    /// True if this key listens on the given resource/event pair, regardless
    /// of its filter.
    pub fn is_scope(&self, resource: &str, event: ChangeKind) -> bool {
        self.resource == resource && self.event == event
    }
}

/// Renders the legacy string form `resource-event[-field=value]`, used only
/// for logs.
impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.resource, self.event)?;
        if let Some(filter) = &self.filter {
            write!(f, "-{}", filter)?;
        }
        Ok(())
    }
}
