//! WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::transport::{Frame, Transport, TransportEvent, TransportLink};
use crate::error::TransportError;

/// [`Transport`] over a WebSocket connection.
///
/// Each opened link runs one read task and one write task; the write task
/// closes the socket when the manager drops its sender.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<TransportLink, TransportError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::new(e.to_string()))?;
        tracing::debug!(%url, "websocket handshake complete");

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<TransportEvent>();

        // Read task
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                let event = match msg_result {
                    Ok(Message::Text(text)) => TransportEvent::Message(text.to_string()),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => TransportEvent::Message(text),
                        Err(_) => {
                            tracing::debug!(len = data.len(), "ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        let _ = events_tx.send(TransportEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => {
                        // Ping/pong frames are answered by tungstenite itself
                        continue;
                    }
                    Err(e) => {
                        let _ = events_tx.send(TransportEvent::Error(e.to_string()));
                        return;
                    }
                };
                if events_tx.send(event).is_err() {
                    // Manager dropped the link
                    return;
                }
            }
            let _ = events_tx.send(TransportEvent::Closed {
                code: 1006,
                reason: "stream ended".to_string(),
            });
        });

        // Write task
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                match frame {
                    Frame::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            tracing::warn!(error = %e, "websocket send failed");
                            break;
                        }
                    }
                    Frame::Close { code, reason } => {
                        let close = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = write.send(Message::Close(Some(close))).await {
                            tracing::debug!(error = %e, "websocket close frame failed");
                        }
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            events: events_rx,
        })
    }
}
