//! Connection manager: owns the transport link and drives its lifecycle.
//!
//! All mutable connection data (state, queue, rate window, link, timer
//! handles) sits behind one mutex, so a transition, a `send()` and a queue
//! flush can never interleave. Callbacks always run after that lock has been
//! released.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use livechat_shared::{Envelope, Payload};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

use super::queue::OutboundQueue;
use super::rate_limit::RateWindow;
use super::transport::{Frame, Transport, TransportEvent, TransportLink};
use super::transport_native::WsTransport;
use super::{ConnectionState, ReconnectPolicy};
use crate::config::ConnectionConfig;
use crate::error::{ConnectError, SendError};
use crate::timer::{Timer, TokioTimer};
use crate::ws::panic_message;

type MessageHandler = Arc<dyn Fn(&Envelope) + Send + Sync>;
type LifecycleHook = Arc<dyn Fn() + Send + Sync>;

/// Identifies a registered handler or hook so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Point-in-time view of a connection, for status displays and diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub queued: usize,
    /// Round trip of the last answered heartbeat.
    pub latency_ms: Option<i64>,
    pub last_pong_at: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub malformed_dropped: u64,
    pub rate_window_count: u32,
}

/// Handle to the single realtime connection of a process.
///
/// Cloning is cheap and every clone drives the same connection. Construct one
/// at startup, hand clones to whoever needs to send or listen, and call
/// [`ConnectionManager::destroy`] at shutdown.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: ConnectionConfig,
    policy: ReconnectPolicy,
    transport: Arc<dyn Transport>,
    timer: Arc<dyn Timer>,
    inner: Mutex<Inner>,
    hooks: RwLock<Hooks>,
    state_tx: watch::Sender<ConnectionState>,
}

struct Inner {
    state: ConnectionState,
    /// Bumped on every connect attempt and every explicit disconnect; tasks
    /// tagged with an older epoch are stale and must not touch the state.
    epoch: u64,
    attempts: u32,
    destroyed: bool,
    queue: OutboundQueue,
    rate: RateWindow,
    link: Option<mpsc::UnboundedSender<Frame>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// The in-flight open/timeout race, owned here rather than by the caller.
    attempt: Option<AbortHandle>,
    pending_ping: Option<DateTime<Utc>>,
    latency_ms: Option<i64>,
    last_pong_at: Option<DateTime<Utc>>,
    messages_sent: u64,
    messages_received: u64,
    malformed_dropped: u64,
}

#[derive(Default)]
struct Hooks {
    next_id: u64,
    message: Vec<(HandlerId, MessageHandler)>,
    connect: Vec<(HandlerId, LifecycleHook)>,
    disconnect: Vec<(HandlerId, LifecycleHook)>,
    destroy: Vec<(HandlerId, LifecycleHook)>,
}

impl Hooks {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    fn clear(&mut self) {
        self.message.clear();
        self.connect.clear();
        self.disconnect.clear();
        self.destroy.clear();
    }

    fn len(&self) -> usize {
        self.message.len() + self.connect.len() + self.disconnect.len() + self.destroy.len()
    }
}

#[derive(Clone, Copy)]
enum Lifecycle {
    Connect,
    Disconnect,
}

impl ConnectionManager {
    /// Manager over a WebSocket transport and the tokio clock.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_transport(config, Arc::new(WsTransport), Arc::new(TokioTimer))
    }

    /// Manager with an explicit transport and time source.
    pub fn with_transport(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        timer: Arc<dyn Timer>,
    ) -> Self {
        let policy = ReconnectPolicy::from_config(&config);
        let inner = Inner {
            state: ConnectionState::Disconnected,
            epoch: 0,
            attempts: 0,
            destroyed: false,
            queue: OutboundQueue::new(config.max_queue_size),
            rate: RateWindow::new(config.rate_budget(), timer.now()),
            link: None,
            reader: None,
            heartbeat: None,
            watchdog: None,
            reconnect: None,
            attempt: None,
            pending_ping: None,
            latency_ms: None,
            last_pong_at: None,
            messages_sent: 0,
            messages_received: 0,
            malformed_dropped: 0,
        };
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                config,
                policy,
                transport,
                timer,
                inner: Mutex::new(inner),
                hooks: RwLock::new(Hooks::default()),
                state_tx,
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().state.is_connected()
    }

    /// Receiver that observes every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> ConnectionStats {
        let now = self.shared.timer.now();
        let mut inner = self.shared.inner.lock();
        ConnectionStats {
            state: inner.state.clone(),
            reconnect_attempts: inner.attempts,
            queued: inner.queue.len(),
            latency_ms: inner.latency_ms,
            last_pong_at: inner.last_pong_at,
            messages_sent: inner.messages_sent,
            messages_received: inner.messages_received,
            malformed_dropped: inner.malformed_dropped,
            rate_window_count: inner.rate.count(now),
        }
    }

    /// Open the connection.
    ///
    /// Resolves immediately if already connected or connecting. A failed
    /// attempt returns its error and, with auto-reconnect on, leaves a retry
    /// scheduled in the background.
    ///
    /// Dropping the returned future does not cancel the attempt; it still
    /// ends in `Connected` or `Failed`.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.shared.connect(None).await
    }

    /// Close the connection and stop reconnecting until `connect()` is called.
    pub fn disconnect(&self) {
        let was_connected = self.shared.shut_down("client disconnect", false);
        if was_connected {
            self.shared.run_lifecycle(Lifecycle::Disconnect);
        }
    }

    /// Tear down for good: close the link, cancel every timer, drop all
    /// handlers and queued messages. Later calls fail with `Destroyed`.
    ///
    /// Destroy hooks run once, after the link is closed; no other hook fires.
    pub fn destroy(&self) {
        let on_destroy: Vec<LifecycleHook> = {
            let mut hooks = self.shared.hooks.write();
            let list = std::mem::take(&mut hooks.destroy);
            hooks.clear();
            list.into_iter().map(|(_, hook)| hook).collect()
        };
        self.shared.shut_down("client destroyed", true);
        call_hooks(on_destroy);
        tracing::info!("connection manager destroyed");
    }

    /// Send an envelope, or queue it while the connection is down.
    ///
    /// Never blocks. Rate-limited messages are dropped, not delayed.
    pub fn send(&self, envelope: impl Into<Envelope>) -> Result<(), SendError> {
        let shared = &self.shared;
        let envelope = envelope.into();
        let should_connect = {
            let mut inner = shared.inner.lock();
            if inner.destroyed {
                return Err(SendError::Destroyed);
            }

            let now = shared.timer.now();
            if !inner.rate.try_acquire(now) {
                let limit = inner.rate.budget();
                tracing::warn!(kind = envelope.kind(), limit, "rate limit exceeded, dropping message");
                return Err(SendError::RateLimitExceeded { limit });
            }

            let envelope = if inner.state.is_connected() {
                match shared.transmit(&mut inner, envelope) {
                    Ok(()) => return Ok(()),
                    Err(unsent) => unsent,
                }
            } else {
                envelope
            };

            let kind = envelope.kind().to_string();
            if let Err(err) = inner.queue.push(envelope) {
                tracing::warn!(%kind, capacity = inner.queue.capacity(), "outbound queue full, rejecting message");
                return Err(err);
            }
            tracing::debug!(%kind, queued = inner.queue.len(), "queued outbound message");
            inner.state == ConnectionState::Disconnected
        };

        if should_connect {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let manager = self.clone();
                runtime.spawn(async move {
                    if let Err(err) = manager.connect().await {
                        tracing::debug!(error = %err, "connect triggered by send failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Register a handler for every inbound envelope, in receipt order.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut hooks = self.shared.hooks.write();
        let id = hooks.allocate();
        hooks.message.push((id, Arc::new(handler)));
        id
    }

    /// Register a hook run after every transition into `Connected`.
    pub fn on_connect<F>(&self, hook: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.shared.hooks.write();
        let id = hooks.allocate();
        hooks.connect.push((id, Arc::new(hook)));
        id
    }

    /// Register a hook run whenever an established connection goes away.
    pub fn on_disconnect<F>(&self, hook: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.shared.hooks.write();
        let id = hooks.allocate();
        hooks.disconnect.push((id, Arc::new(hook)));
        id
    }

    /// Register a hook run once by [`destroy`](Self::destroy), after the
    /// link is closed.
    pub fn on_destroy<F>(&self, hook: F) -> HandlerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut hooks = self.shared.hooks.write();
        let id = hooks.allocate();
        hooks.destroy.push((id, Arc::new(hook)));
        id
    }

    /// Remove a handler or hook. Returns false if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut hooks = self.shared.hooks.write();
        let before = hooks.len();
        hooks.message.retain(|(h, _)| *h != id);
        hooks.connect.retain(|(h, _)| *h != id);
        hooks.disconnect.retain(|(h, _)| *h != id);
        hooks.destroy.retain(|(h, _)| *h != id);
        before != hooks.len()
    }
}

impl Shared {
    /// `retry_epoch` is set by a scheduled retry: the epoch of the connection
    /// it was scheduled for. Anything that bumped the epoch since then (an
    /// explicit connect or disconnect) makes the retry stale.
    async fn connect(self: &Arc<Self>, retry_epoch: Option<u64>) -> Result<(), ConnectError> {
        let from_retry = retry_epoch.is_some();
        let attempt = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(ConnectError::Destroyed);
            }
            if retry_epoch.is_some_and(|epoch| epoch != inner.epoch) {
                return Err(ConnectError::Aborted);
            }
            if matches!(
                inner.state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Ok(());
            }
            if let Some(handle) = inner.reconnect.take() {
                // The retry task calls in here itself; only a caller-initiated
                // connect cancels a pending retry.
                if !from_retry {
                    handle.abort();
                }
            }
            if !from_retry {
                inner.attempts = 0;
            }
            inner.epoch += 1;
            self.transition(&mut inner, ConnectionState::Connecting);

            // Runs on its own task: the caller may drop its future, the
            // attempt still has to leave `Connecting`.
            let handle = tokio::spawn(Arc::clone(self).attempt(inner.epoch));
            inner.attempt = Some(handle.abort_handle());
            handle
        };

        match attempt.await {
            Ok(result) => result,
            // Aborted by disconnect() or destroy().
            Err(_) => Err(ConnectError::Aborted),
        }
    }

    async fn attempt(self: Arc<Self>, epoch: u64) -> Result<(), ConnectError> {
        tracing::info!(url = %self.config.url, "connecting");
        let timeout = self.config.connection_timeout();
        let outcome = tokio::select! {
            result = self.transport.open(&self.config.url) => result.map_err(ConnectError::from),
            _ = self.timer.sleep(timeout) => Err(ConnectError::Timeout(timeout)),
        };

        match outcome {
            Ok(link) => self.on_open(epoch, link),
            Err(err) => {
                self.on_connect_failed(epoch, &err);
                Err(err)
            }
        }
    }

    fn on_open(self: &Arc<Self>, epoch: u64, link: TransportLink) -> Result<(), ConnectError> {
        let TransportLink { outbound, events } = link;
        {
            let mut inner = self.inner.lock();
            if inner.destroyed || inner.epoch != epoch || inner.state != ConnectionState::Connecting {
                let _ = outbound.send(Frame::close_normal("connection superseded"));
                return Err(if inner.destroyed {
                    ConnectError::Destroyed
                } else {
                    ConnectError::Aborted
                });
            }

            self.transition(&mut inner, ConnectionState::Connected);
            inner.attempt = None;
            inner.attempts = 0;
            inner.pending_ping = None;
            inner.link = Some(outbound);

            let flushed = self.flush_queue(&mut inner);
            let weak = Arc::downgrade(self);
            inner.reader = Some(tokio::spawn(read_loop(weak.clone(), epoch, events)));
            inner.heartbeat = Some(tokio::spawn(heartbeat_loop(
                weak,
                epoch,
                self.config.heartbeat_interval(),
                self.timer.clone(),
            )));
            tracing::info!(url = %self.config.url, flushed, "connected");
        }

        self.run_lifecycle(Lifecycle::Connect);
        Ok(())
    }

    fn on_connect_failed(self: &Arc<Self>, epoch: u64, err: &ConnectError) {
        let mut inner = self.inner.lock();
        if inner.destroyed || inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            return;
        }
        tracing::warn!(error = %err, "connection attempt failed");
        inner.attempt = None;
        let reason = err.to_string();
        self.transition(
            &mut inner,
            ConnectionState::Failed {
                reason: reason.clone(),
            },
        );
        self.schedule_reconnect(&mut inner, &reason);
    }

    /// An established link went away without the client asking for it.
    fn on_link_lost(self: &Arc<Self>, epoch: u64, reason: &str) {
        {
            let mut inner = self.inner.lock();
            if inner.destroyed || inner.epoch != epoch || !inner.state.is_connected() {
                return;
            }
            tracing::warn!(%reason, "connection lost");
            Self::release_link(&mut inner, None);
            self.schedule_reconnect(&mut inner, reason);
        }
        self.run_lifecycle(Lifecycle::Disconnect);
    }

    /// Reconnection procedure: retry with backoff or give up as `Failed`.
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, reason: &str) {
        if !self.config.auto_reconnect {
            self.fail(inner, format!("{reason} (auto-reconnect disabled)"));
            return;
        }
        if inner.attempts >= self.policy.max_attempts {
            tracing::error!(attempts = inner.attempts, "max reconnect attempts exceeded, giving up");
            self.fail(
                inner,
                format!("Max reconnect attempts ({}) exceeded", self.policy.max_attempts),
            );
            return;
        }

        inner.attempts += 1;
        let attempt = inner.attempts;
        let delay = self.policy.delay_for_attempt(attempt);
        self.transition(inner, ConnectionState::Reconnecting { attempt });
        tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        let weak = Arc::downgrade(self);
        let epoch = inner.epoch;
        let sleep = self.timer.sleep(delay);
        inner.reconnect = Some(tokio::spawn(async move {
            sleep.await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Err(err) = shared.connect(Some(epoch)).await {
                tracing::debug!(attempt, error = %err, "reconnect attempt failed");
            }
        }));
    }

    /// Stop everything and move to `Disconnected`. Returns whether a live
    /// connection was closed.
    fn shut_down(&self, reason: &str, destroy: bool) -> bool {
        let mut inner = self.inner.lock();
        if let Some(handle) = inner.reconnect.take() {
            handle.abort();
        }
        if let Some(attempt) = inner.attempt.take() {
            attempt.abort();
        }
        inner.epoch += 1;
        inner.attempts = 0;
        let was_connected = inner.state.is_connected();
        Self::release_link(&mut inner, Some(reason));
        if inner.state != ConnectionState::Disconnected {
            self.transition(&mut inner, ConnectionState::Disconnected);
        }
        if destroy {
            inner.destroyed = true;
            inner.queue.clear();
        }
        tracing::info!(%reason, "disconnected");
        was_connected
    }

    /// Drop the link and every task bound to it, optionally sending a close frame.
    fn release_link(inner: &mut Inner, close_reason: Option<&str>) {
        for handle in [
            inner.heartbeat.take(),
            inner.watchdog.take(),
            inner.reader.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        if let Some(link) = inner.link.take() {
            if let Some(reason) = close_reason {
                let _ = link.send(Frame::close_normal(reason));
            }
        }
        inner.pending_ping = None;
    }

    /// Enter the terminal `Failed` state, replacing the reason if a failed
    /// attempt already put us there.
    fn fail(&self, inner: &mut Inner, reason: String) {
        let next = ConnectionState::Failed { reason };
        if inner.state.is_failed() {
            inner.state = next.clone();
            self.state_tx.send_replace(next);
        } else {
            self.transition(inner, next);
        }
    }

    fn transition(&self, inner: &mut Inner, next: ConnectionState) {
        if !inner.state.can_transition_to(&next) {
            tracing::error!(from = ?inner.state, to = ?next, "rejected invalid connection state transition");
            return;
        }
        tracing::debug!(from = inner.state.name(), to = next.name(), "connection state changed");
        inner.state = next.clone();
        self.state_tx.send_replace(next);
    }

    /// Write one envelope to the live link. Hands the envelope back if there
    /// is no usable link.
    fn transmit(&self, inner: &mut Inner, envelope: Envelope) -> Result<(), Envelope> {
        let Some(link) = inner.link.as_ref() else {
            return Err(envelope);
        };
        let envelope = envelope.stamped(&self.config.client_id);
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(error = %err, kind = envelope.kind(), "failed to encode envelope, dropping");
                return Ok(());
            }
        };
        if link.send(Frame::Text(text)).is_err() {
            return Err(envelope);
        }
        inner.messages_sent += 1;
        Ok(())
    }

    fn flush_queue(&self, inner: &mut Inner) -> usize {
        let mut flushed = 0;
        while let Some(envelope) = inner.queue.pop_front() {
            if let Err(unsent) = self.transmit(inner, envelope) {
                inner.queue.restore_front(unsent);
                break;
            }
            flushed += 1;
        }
        flushed
    }

    fn handle_inbound(&self, epoch: u64, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed inbound message");
                self.inner.lock().malformed_dropped += 1;
                return;
            }
        };

        {
            let mut inner = self.inner.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.messages_received += 1;
            if matches!(envelope.payload(), Payload::Pong) {
                let now = Utc::now();
                if let Some(sent_at) = envelope.sent_at() {
                    let latency = (now - sent_at).num_milliseconds().max(0);
                    inner.latency_ms = Some(latency);
                    tracing::trace!(latency_ms = latency, "heartbeat answered");
                }
                inner.last_pong_at = Some(now);
                inner.pending_ping = None;
                if let Some(watchdog) = inner.watchdog.take() {
                    watchdog.abort();
                }
            }
        }

        let handlers: Vec<MessageHandler> = self
            .hooks
            .read()
            .message
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&envelope))) {
                tracing::error!(
                    kind = envelope.kind(),
                    panic = panic_message(&*panic),
                    "message handler panicked"
                );
            }
        }
    }

    fn send_ping(self: &Arc<Self>, epoch: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.destroyed || inner.epoch != epoch || !inner.state.is_connected() {
            return false;
        }
        let sent_at = Utc::now();
        if self.transmit(&mut inner, Envelope::ping(sent_at)).is_err() {
            return false;
        }
        // Only the oldest unanswered ping is watched.
        if let (Some(timeout), None) = (self.config.heartbeat_timeout(), inner.pending_ping) {
            inner.pending_ping = Some(sent_at);
            inner.watchdog = Some(tokio::spawn(heartbeat_watchdog(
                Arc::downgrade(self),
                epoch,
                sent_at,
                self.timer.sleep(timeout),
            )));
        }
        true
    }

    fn on_heartbeat_timeout(self: &Arc<Self>, epoch: u64, sent_at: DateTime<Utc>) {
        let expired = {
            let inner = self.inner.lock();
            inner.epoch == epoch && inner.pending_ping == Some(sent_at)
        };
        if expired {
            tracing::warn!(timeout_ms = self.config.heartbeat_timeout_ms, "heartbeat unanswered");
            self.on_link_lost(epoch, "heartbeat timeout");
        }
    }

    fn run_lifecycle(&self, which: Lifecycle) {
        let hooks: Vec<LifecycleHook> = {
            let hooks = self.hooks.read();
            let list = match which {
                Lifecycle::Connect => &hooks.connect,
                Lifecycle::Disconnect => &hooks.disconnect,
            };
            list.iter().map(|(_, hook)| hook.clone()).collect()
        };
        call_hooks(hooks);
    }
}

fn call_hooks(hooks: Vec<LifecycleHook>) {
    for hook in hooks {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| hook())) {
            tracing::error!(panic = panic_message(&*panic), "lifecycle hook panicked");
        }
    }
}

async fn read_loop(
    shared: Weak<Shared>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Message(text) => shared.handle_inbound(epoch, &text),
            TransportEvent::Closed { code, reason } => {
                shared.on_link_lost(epoch, &format!("closed by remote (code {code}): {reason}"));
                return;
            }
            TransportEvent::Error(err) => {
                shared.on_link_lost(epoch, &format!("transport error: {err}"));
                return;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.on_link_lost(epoch, "transport stream ended");
    }
}

async fn heartbeat_loop(
    shared: Weak<Shared>,
    epoch: u64,
    interval: Duration,
    timer: Arc<dyn Timer>,
) {
    loop {
        timer.sleep(interval).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.send_ping(epoch) {
            return;
        }
    }
}

async fn heartbeat_watchdog(
    shared: Weak<Shared>,
    epoch: u64,
    sent_at: DateTime<Utc>,
    deadline: futures_util::future::BoxFuture<'static, ()>,
) {
    deadline.await;
    if let Some(shared) = shared.upgrade() {
        shared.on_heartbeat_timeout(epoch, sent_at);
    }
}
