//! In-memory transport and helpers shared by the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livechat_client::{
    ConnectionConfig, ConnectionManager, Frame, Transport, TransportError, TransportEvent,
    TransportLink, TokioTimer,
};
use livechat_shared::{Envelope, Payload};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// How the next `open()` call should behave.
#[derive(Debug, Clone)]
pub enum Outcome {
    Accept,
    Refuse(String),
    /// Never resolve, so the connection timeout fires.
    Hang,
}

#[derive(Default)]
struct State {
    script: VecDeque<Outcome>,
    opens: usize,
    servers: VecDeque<ServerEnd>,
}

/// Transport that hands each accepted link's far end to the test.
///
/// Opens follow the queued script and accept once it runs out.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<State>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = Outcome>) {
        self.state.lock().script.extend(outcomes);
    }

    pub fn refuse_next(&self, times: usize) {
        self.script((0..times).map(|_| Outcome::Refuse("connection refused".into())));
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    /// Far end of the oldest accepted link not yet taken.
    pub fn server(&self) -> ServerEnd {
        self.state
            .lock()
            .servers
            .pop_front()
            .expect("no accepted connection")
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, _url: &str) -> Result<TransportLink, TransportError> {
        let outcome = {
            let mut state = self.state.lock();
            state.opens += 1;
            state.script.pop_front().unwrap_or(Outcome::Accept)
        };
        match outcome {
            Outcome::Accept => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (ev_tx, ev_rx) = mpsc::unbounded_channel();
                self.state.lock().servers.push_back(ServerEnd {
                    from_client: out_rx,
                    to_client: ev_tx,
                });
                Ok(TransportLink {
                    outbound: out_tx,
                    events: ev_rx,
                })
            }
            Outcome::Refuse(reason) => Err(TransportError::new(reason)),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

/// Server side of one mock link.
pub struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl ServerEnd {
    /// Every frame the client has written so far.
    pub fn frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Text frames written so far, decoded.
    pub fn envelopes(&mut self) -> Vec<Envelope> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(Envelope::decode(&text).expect("client sent bad json")),
                Frame::Close { .. } => None,
            })
            .collect()
    }

    /// Decoded envelopes of one type tag.
    pub fn envelopes_of(&mut self, kind: &str) -> Vec<Envelope> {
        self.envelopes()
            .into_iter()
            .filter(|env| env.kind() == kind)
            .collect()
    }

    pub fn push(&self, payload: impl Into<Envelope>) {
        let text = payload.into().encode().expect("encode");
        self.push_raw(&text);
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(TransportEvent::Message(text.to_string()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.to_client.send(TransportEvent::Closed {
            code,
            reason: "server went away".into(),
        });
    }
}

/// Config with timers far enough apart not to interfere unless a test asks.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        url: "ws://test.invalid/realtime".into(),
        client_id: "test-client".into(),
        heartbeat_interval_ms: 3_600_000,
        ..ConnectionConfig::default()
    }
}

pub fn manager(config: ConnectionConfig, transport: &MockTransport) -> ConnectionManager {
    ConnectionManager::with_transport(config, Arc::new(transport.clone()), Arc::new(TokioTimer))
}

/// Let spawned tasks run without advancing the clock past pending timers.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Advance the paused clock by `ms` and let everything due run.
pub async fn advance_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    settle().await;
}

pub fn custom_body(envelope: &Envelope) -> Option<serde_json::Value> {
    match envelope.payload() {
        Payload::Custom { body, .. } => body.clone(),
        _ => None,
    }
}
