//! Subscriptions the chat widget actually makes, as typed values.

use livechat_shared::{ChangeKind, Filter};

use super::multiplexer::{ChangeEvent, ChangeStream, Subscription, SubscriptionMultiplexer};

pub const MESSAGES: &str = "messages";
pub const SESSIONS: &str = "sessions";
pub const WIDGET_CONFIGS: &str = "widget_configs";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feed {
    /// New chat messages posted to one session.
    SessionMessages { session_id: String },
    /// Status changes (assignment, closing, ...) of one session.
    SessionStatus { session_id: String },
    /// Any change to widget configuration, optionally for one widget.
    ConfigChanges { widget_id: Option<String> },
}

impl Feed {
    pub fn resource(&self) -> &'static str {
        match self {
            Feed::SessionMessages { .. } => MESSAGES,
            Feed::SessionStatus { .. } => SESSIONS,
            Feed::ConfigChanges { .. } => WIDGET_CONFIGS,
        }
    }

    pub fn events(&self) -> &'static [ChangeKind] {
        match self {
            Feed::SessionMessages { .. } => &[ChangeKind::Insert],
            Feed::SessionStatus { .. } => &[ChangeKind::Update],
            Feed::ConfigChanges { .. } => &ChangeKind::ALL,
        }
    }

    pub fn filter(&self) -> Option<Filter> {
        match self {
            Feed::SessionMessages { session_id } => Some(Filter::new("session_id", session_id)),
            Feed::SessionStatus { session_id } => Some(Filter::new("id", session_id)),
            Feed::ConfigChanges { widget_id } => {
                widget_id.as_ref().map(|id| Filter::new("widget_id", id))
            }
        }
    }
}

impl SubscriptionMultiplexer {
    pub fn watch<F>(&self, feed: &Feed, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(feed.resource(), feed.events(), feed.filter(), callback)
    }

    pub fn watch_stream(&self, feed: &Feed) -> ChangeStream {
        self.subscribe_stream(feed.resource(), feed.events(), feed.filter())
    }
}
