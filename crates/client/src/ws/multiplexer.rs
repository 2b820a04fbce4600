//! Fan-out of realtime change notifications to application subscribers.
//!
//! Many local callbacks share one server-side subscription per
//! [`ChannelKey`]. The registry is the source of truth for what the server
//! should be sending us and is replayed on every (re)connect.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use futures_channel::mpsc;
use futures_util::{Stream, StreamExt};
use livechat_shared::{ChangeKind, ChannelKey, Envelope, Filter, Payload};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::connection::{ConnectionManager, HandlerId};
use super::panic_message;

type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// What a subscriber receives for one matching CHANGE notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// The changed record as sent by the server.
    pub new: Value,
    pub event_type: ChangeKind,
    pub resource: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CallbackId(u64);

struct Registry {
    next_id: u64,
    channels: HashMap<ChannelKey, Vec<(CallbackId, ChangeCallback)>>,
    /// True once the registry has been replayed for the current connection.
    /// Until then new keys are left for `resubscribe_all` to send.
    synced: bool,
}

struct MuxShared {
    connection: ConnectionManager,
    registry: Mutex<Registry>,
    hook_ids: Mutex<Vec<HandlerId>>,
}

/// Routes CHANGE envelopes from one [`ConnectionManager`] to subscribers.
///
/// Create exactly one per manager. Clones share the same registry.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    shared: Arc<MuxShared>,
}

impl SubscriptionMultiplexer {
    pub fn new(connection: ConnectionManager) -> Self {
        let shared = Arc::new(MuxShared {
            connection: connection.clone(),
            registry: Mutex::new(Registry {
                next_id: 0,
                channels: HashMap::new(),
                synced: false,
            }),
            hook_ids: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&shared);
        let on_message = connection.on_message({
            let weak = weak.clone();
            move |envelope| {
                if let Some(mux) = weak.upgrade() {
                    mux.route(envelope);
                }
            }
        });
        let on_connect = connection.on_connect({
            let weak = weak.clone();
            move || {
                if let Some(mux) = weak.upgrade() {
                    mux.resubscribe_all();
                }
            }
        });
        let on_disconnect = connection.on_disconnect({
            let weak = weak.clone();
            move || {
                if let Some(mux) = weak.upgrade() {
                    mux.registry.lock().synced = false;
                }
            }
        });
        let on_destroy = connection.on_destroy(move || {
            if let Some(mux) = weak.upgrade() {
                mux.release();
            }
        });
        *shared.hook_ids.lock() = vec![on_message, on_connect, on_disconnect, on_destroy];

        // Attached to a connection that is already up.
        shared.resubscribe_all();

        Self { shared }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.shared.connection
    }

    /// Register `callback` for each of `events` on `resource`, optionally
    /// narrowed by `filter`.
    ///
    /// Only keys that are new to the registry cost a SUBSCRIBE on the wire,
    /// and only while connected; otherwise the next connect replays them.
    pub fn subscribe<F>(
        &self,
        resource: &str,
        events: &[ChangeKind],
        filter: Option<Filter>,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let callback: ChangeCallback = Arc::new(callback);
        let mut keys: Vec<ChannelKey> = Vec::with_capacity(events.len());
        for &event in events {
            let key = ChannelKey {
                resource: resource.to_string(),
                event,
                filter: filter.clone(),
            };
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let mut registry = self.shared.registry.lock();
        registry.next_id += 1;
        let id = CallbackId(registry.next_id);
        let live = registry.synced && self.shared.connection.is_connected();

        for key in &keys {
            let callbacks = registry.channels.entry(key.clone()).or_default();
            let is_new = callbacks.is_empty();
            callbacks.push((id, callback.clone()));
            if is_new {
                tracing::debug!(channel = %key, "channel added");
                if live {
                    self.shared.send_control(Envelope::subscribe(key), key);
                }
            }
        }

        Subscription {
            id,
            keys,
            mux: Arc::downgrade(&self.shared),
            active: AtomicBool::new(true),
        }
    }

    /// Like [`subscribe`](Self::subscribe), delivering events as a stream.
    /// Dropping the stream unsubscribes.
    pub fn subscribe_stream(
        &self,
        resource: &str,
        events: &[ChangeKind],
        filter: Option<Filter>,
    ) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded();
        let subscription = self.subscribe(resource, events, filter, move |event| {
            let _ = tx.unbounded_send(event.clone());
        });
        ChangeStream { subscription, rx }
    }

    /// Send one SUBSCRIBE for every registered channel. Runs automatically
    /// whenever the connection becomes `Connected`; does nothing while
    /// disconnected. Returns the number of channels replayed.
    pub fn resubscribe_all(&self) -> usize {
        self.shared.resubscribe_all()
    }

    pub fn active_channels(&self) -> Vec<ChannelKey> {
        self.shared.registry.lock().channels.keys().cloned().collect()
    }

    /// Number of callbacks registered on `key` (0 if the key is absent).
    pub fn callback_count(&self, key: &ChannelKey) -> usize {
        self.shared
            .registry
            .lock()
            .channels
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Drop every subscription and detach from the connection.
    pub fn close(&self) {
        for id in self.shared.hook_ids.lock().drain(..) {
            self.shared.connection.remove_handler(id);
        }
        let mut registry = self.shared.registry.lock();
        let live = registry.synced && self.shared.connection.is_connected();
        for key in registry.channels.keys() {
            if live {
                self.shared.send_control(Envelope::unsubscribe(key), key);
            }
        }
        registry.channels.clear();
        registry.synced = false;
    }
}

impl MuxShared {
    /// The connection was destroyed: forget every channel. The manager has
    /// already dropped our hooks.
    fn release(&self) {
        self.hook_ids.lock().clear();
        let mut registry = self.registry.lock();
        let channels = registry.channels.len();
        registry.channels.clear();
        registry.synced = false;
        tracing::debug!(channels, "subscription registry released");
    }

    fn resubscribe_all(&self) -> usize {
        let mut registry = self.registry.lock();
        if !self.connection.is_connected() {
            return 0;
        }
        registry.synced = true;
        for key in registry.channels.keys() {
            self.send_control(Envelope::subscribe(key), key);
        }
        let count = registry.channels.len();
        if count > 0 {
            tracing::info!(channels = count, "resubscribed");
        }
        count
    }

    fn send_control(&self, envelope: Envelope, key: &ChannelKey) {
        let kind = envelope.kind().to_string();
        if let Err(err) = self.connection.send(envelope) {
            tracing::warn!(channel = %key, %kind, error = %err, "failed to send subscription control message");
        }
    }

    fn remove(&self, id: CallbackId, keys: &[ChannelKey]) {
        let mut registry = self.registry.lock();
        let live = registry.synced && self.connection.is_connected();
        for key in keys {
            let Some(callbacks) = registry.channels.get_mut(key) else {
                continue;
            };
            callbacks.retain(|(cb, _)| *cb != id);
            if callbacks.is_empty() {
                registry.channels.remove(key);
                tracing::debug!(channel = %key, "channel removed");
                if live {
                    self.send_control(Envelope::unsubscribe(key), key);
                }
            }
        }
    }

    fn route(&self, envelope: &Envelope) {
        let Payload::Change(change) = envelope.payload() else {
            return;
        };
        let Ok(event) = change.event.parse::<ChangeKind>() else {
            tracing::debug!(event = %change.event, resource = %change.resource, "ignoring change with unknown event");
            return;
        };

        let callbacks: Vec<ChangeCallback> = {
            let registry = self.registry.lock();
            let exact = ChannelKey::new(change.resource.as_str(), event);
            let mut matched: Vec<ChangeCallback> = registry
                .channels
                .get(&exact)
                .map(|cbs| cbs.iter().map(|(_, cb)| cb.clone()).collect())
                .unwrap_or_default();
            for (key, cbs) in &registry.channels {
                let Some(filter) = &key.filter else {
                    continue;
                };
                if key.is_scope(&change.resource, event) && filter.matches(&change.data) {
                    matched.extend(cbs.iter().map(|(_, cb)| cb.clone()));
                }
            }
            matched
        };
        if callbacks.is_empty() {
            return;
        }

        let event = ChangeEvent {
            new: change.data.clone(),
            event_type: event,
            resource: change.resource.clone(),
        };
        for callback in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                tracing::error!(
                    resource = %event.resource,
                    event = %event.event_type,
                    panic = panic_message(&*panic),
                    "subscriber callback panicked"
                );
            }
        }
    }
}

/// Handle returned by [`SubscriptionMultiplexer::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`unsubscribe`](Self::unsubscribe) to end it.
pub struct Subscription {
    id: CallbackId,
    keys: Vec<ChannelKey>,
    mux: Weak<MuxShared>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove this subscription's callback from every channel it joined.
    /// Safe to call repeatedly and after the connection is destroyed.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(mux) = self.mux.upgrade() {
            mux.remove(self.id, &self.keys);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn keys(&self) -> &[ChannelKey] {
        &self.keys
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("keys", &self.keys)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Stream of [`ChangeEvent`]s for one subscription.
pub struct ChangeStream {
    subscription: Subscription,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;

    fn offline_mux() -> SubscriptionMultiplexer {
        SubscriptionMultiplexer::new(ConnectionManager::new(ConnectionConfig::default()))
    }

    fn change(resource: &str, event: &str, data: Value) -> Envelope {
        Envelope::new(Payload::Change(livechat_shared::ChangeNotification {
            resource: resource.into(),
            event: event.into(),
            data,
        }))
    }

    #[test]
    fn callbacks_share_one_channel() {
        let mux = offline_mux();
        let a = mux.subscribe("messages", &[ChangeKind::Insert], None, |_| {});
        let b = mux.subscribe("messages", &[ChangeKind::Insert], None, |_| {});
        let key = ChannelKey::new("messages", ChangeKind::Insert);

        assert_eq!(mux.active_channels(), vec![key.clone()]);
        assert_eq!(mux.callback_count(&key), 2);

        a.unsubscribe();
        assert_eq!(mux.callback_count(&key), 1);
        b.unsubscribe();
        assert!(mux.active_channels().is_empty());
    }

    #[test]
    fn duplicate_events_register_once() {
        let mux = offline_mux();
        let sub = mux.subscribe(
            "sessions",
            &[ChangeKind::Update, ChangeKind::Update],
            None,
            |_| {},
        );
        assert_eq!(sub.keys().len(), 1);
        assert_eq!(
            mux.callback_count(&ChannelKey::new("sessions", ChangeKind::Update)),
            1
        );
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let mux = offline_mux();
        let sub = mux.subscribe("messages", &ChangeKind::ALL, None, |_| {});
        assert_eq!(mux.active_channels().len(), 3);
        sub.unsubscribe();
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert!(mux.active_channels().is_empty());
    }

    #[test]
    fn routes_exact_and_matching_filtered_channels() {
        let mux = offline_mux();
        let hits = Arc::new(Mutex::new(Vec::new()));

        for (label, filter) in [
            ("all", None),
            ("s1", Some(Filter::new("id", "S1"))),
            ("s2", Some(Filter::new("id", "S2"))),
        ] {
            let hits = hits.clone();
            mux.subscribe("sessions", &[ChangeKind::Update], filter, move |event| {
                assert_eq!(event.event_type, ChangeKind::Update);
                hits.lock().push(label);
            });
        }

        mux.shared
            .route(&change("sessions", "update", serde_json::json!({"id": "S1", "status": "closed"})));

        let mut hits = hits.lock().clone();
        hits.sort();
        assert_eq!(hits, vec!["all", "s1"]);
    }

    #[test]
    fn ignores_other_events_and_unknown_kinds() {
        let mux = offline_mux();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        mux.subscribe("messages", &[ChangeKind::Insert], None, move |_| {
            *counter.lock() += 1;
        });

        mux.shared.route(&change("messages", "delete", Value::Null));
        mux.shared.route(&change("messages", "truncate", Value::Null));
        mux.shared.route(&change("sessions", "insert", Value::Null));
        mux.shared.route(&Envelope::new(Payload::Data(Value::Null)));
        assert_eq!(*hits.lock(), 0);

        mux.shared.route(&change("messages", "INSERT", Value::Null));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let mux = offline_mux();
        let delivered = Arc::new(AtomicBool::new(false));
        mux.subscribe("messages", &[ChangeKind::Insert], None, |_| panic!("subscriber bug"));
        let flag = delivered.clone();
        mux.subscribe("messages", &[ChangeKind::Insert], None, move |_| {
            flag.store(true, Ordering::SeqCst);
        });

        mux.shared.route(&change("messages", "insert", serde_json::json!({})));
        assert!(delivered.load(Ordering::SeqCst));
    }

    #[test]
    fn close_clears_registry() {
        let mux = offline_mux();
        let sub = mux.subscribe("messages", &[ChangeKind::Insert], None, |_| {});
        mux.close();
        assert!(mux.active_channels().is_empty());
        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
