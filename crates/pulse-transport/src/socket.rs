//! WebSocket connector over `tokio-tungstenite`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use pulse_core::PulseError;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::connector::{Connector, Payload, TransportEvent};

/// Outbound queue depth; sends beyond it are refused, not buffered.
const OUT_CHANNEL_CAPACITY: usize = 64;

/// Persistent duplex WebSocket link.
pub struct SocketConnector {
    url: RwLock<Url>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    out_tx: Mutex<Option<mpsc::Sender<Message>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl SocketConnector {
    /// Create a connector that dials `url` and reports on `events`.
    pub fn new(url: Url, events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            url: RwLock::new(url),
            events,
            connected: Arc::new(AtomicBool::new(false)),
            out_tx: Mutex::new(None),
            cancel: Mutex::new(None),
        }
    }

    /// Replace the dial URL used by the next `connect` (session resume
    /// parameters change between dials).
    pub fn set_url(&self, url: Url) {
        *self.url.write() = url;
    }
}

#[async_trait]
impl Connector for SocketConnector {
    async fn connect(&self) -> Result<(), PulseError> {
        if self.connected.load(Ordering::Relaxed) {
            return Ok(());
        }
        let url = self.url.read().clone();
        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|err| PulseError::transport(format!("websocket connect: {err}")))?;
        let (out_tx, out_rx) = mpsc::channel::<Message>(OUT_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        *self.out_tx.lock() = Some(out_tx);
        *self.cancel.lock() = Some(cancel.clone());
        self.connected.store(true, Ordering::Relaxed);

        let _ = self.events.send(TransportEvent::Connected).await;
        drop(tokio::spawn(socket_loop(
            ws,
            out_rx,
            self.events.clone(),
            Arc::clone(&self.connected),
            cancel,
        )));
        Ok(())
    }

    async fn disconnect(&self, code: u16, reason: &str) {
        debug!(code, reason, "socket disconnect");
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.out_tx.lock().take();
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
    }

    async fn send(&self, payload: Payload) -> bool {
        let Some(tx) = self.out_tx.lock().clone() else {
            return false;
        };
        let msg = match payload {
            Payload::Text(text) => Message::Text(text.into()),
            Payload::Binary(bytes) => Message::Binary(bytes.into()),
        };
        tx.try_send(msg).is_ok()
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Owns both halves of the socket: forwards outbound messages, surfaces
/// inbound payloads, and reports remote loss exactly once.
async fn socket_loop(
    ws: WsStream,
    mut out_rx: mpsc::Receiver<Message>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let lost: Option<(u16, String)> = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                let _ = ws_tx.send(Message::Close(Some(frame))).await;
                break None;
            }
            out = out_rx.recv() => {
                let Some(msg) = out else { break None };
                if let Err(err) = ws_tx.send(msg).await {
                    break Some((1006, format!("send failed: {err}")));
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(TransportEvent::Message(Payload::Text(text.to_string()))).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = events.send(TransportEvent::Message(Payload::Binary(bytes.to_vec()))).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        break Some((code, reason));
                    }
                    Some(Ok(_)) => {} // ping/pong handled by tungstenite
                    Some(Err(err)) => {
                        warn!(%err, "websocket read error");
                        break Some((1006, err.to_string()));
                    }
                    None => break Some((1006, "stream ended".into())),
                }
            }
        }
    };

    connected.store(false, Ordering::Relaxed);
    if let Some((code, reason)) = lost {
        let _ = events
            .send(TransportEvent::Disconnected { code, reason })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connector() -> (SocketConnector, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let url = Url::parse("ws://127.0.0.1:1/sub?CHANNEL_ID=c1").unwrap();
        (SocketConnector::new(url, tx), rx)
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let (sock, _rx) = connector();
        assert!(!sock.connected());
    }

    #[tokio::test]
    async fn send_while_disconnected_is_refused() {
        let (sock, _rx) = connector();
        assert!(!sock.send(Payload::Text("x".into())).await);
    }

    #[tokio::test]
    async fn connect_to_dead_endpoint_is_transport_error() {
        let (sock, _rx) = connector();
        let err = sock.connect().await.unwrap_err();
        assert!(matches!(err, PulseError::Transport { .. }));
        assert!(!sock.connected());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (sock, _rx) = connector();
        sock.disconnect(1000, "bye").await;
        sock.disconnect(1000, "bye again").await;
        assert!(!sock.connected());
    }

    #[tokio::test]
    async fn set_url_replaces_dial_target() {
        let (sock, _rx) = connector();
        let replacement = Url::parse("ws://127.0.0.1:1/sub?CHANNEL_ID=c2&mid=m9").unwrap();
        sock.set_url(replacement.clone());
        assert_eq!(*sock.url.read(), replacement);
    }
}
