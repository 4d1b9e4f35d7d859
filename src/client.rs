//! ProtocolClient: owns one persistent WebSocket to the remote service and
//! translates between wire messages and typed [`ClientEvent`]s.

use std::sync::{Arc, Mutex};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SessionConfig;
use crate::error::SessionError;
pub use crate::protocol::ClientEvent;
use crate::protocol::{ClientContentMessage, RealtimeInputMessage, SetupMessage, decode_server_message};

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Transport-level connection state. Protocol-level readiness is signalled
/// separately by [`ClientEvent::Connected`] once the server acks setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Closed,
}

pub struct ProtocolClient {
    config: SessionConfig,
    event_tx: mpsc::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnState>,
    /// Serializes dial attempts so concurrent `connect()` calls share one.
    dial_lock: tokio::sync::Mutex<()>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
}

impl ProtocolClient {
    pub fn new(config: SessionConfig, event_tx: mpsc::Sender<ClientEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnState::Idle);
        Self {
            config,
            event_tx,
            state_tx,
            dial_lock: tokio::sync::Mutex::new(()),
            outbound: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state_tx.borrow()
    }

    /// Open the transport and send the setup message. Idempotent: while a
    /// dial is in flight, callers wait for it instead of opening a second
    /// connection, and an already-open client returns immediately.
    pub async fn connect(&self, setup: &SetupMessage) -> Result<(), SessionError> {
        let _guard = self.dial_lock.lock().await;
        if self.state() == ConnState::Open {
            debug!("connect: already open");
            return Ok(());
        }
        self.state_tx.send_replace(ConnState::Connecting);

        let url = self.endpoint_url()?;
        info!("Connecting to {}...", url.host_str().unwrap_or("?"));
        let (ws, _) = connect_async(url.as_str()).await.map_err(|e| {
            self.state_tx.send_replace(ConnState::Closed);
            SessionError::Connection(e.into())
        })?;
        let (mut write, read) = ws.split();

        let setup_json = serde_json::to_string(setup)
            .map_err(|e| SessionError::Protocol(format!("setup message: {}", e)))?;
        write.send(Message::Text(setup_json.into())).await.map_err(|e| {
            self.state_tx.send_replace(ConnState::Closed);
            SessionError::Connection(e.into())
        })?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        *self.outbound.lock().expect("outbound slot poisoned") = Some(out_tx);
        tokio::spawn(write_loop(out_rx, write));
        tokio::spawn(read_loop(
            read,
            self.event_tx.clone(),
            self.state_tx.clone(),
            self.outbound.clone(),
        ));

        self.state_tx.send_replace(ConnState::Open);
        Ok(())
    }

    /// Close the transport. Safe to call repeatedly or when never connected.
    pub fn disconnect(&self) {
        let had_connection = self
            .outbound
            .lock()
            .expect("outbound slot poisoned")
            .take()
            .is_some();
        if had_connection {
            info!("Disconnecting");
        }
        self.state_tx.send_replace(ConnState::Closed);
    }

    /// One captured PCM frame. Best effort: dropped with a warning when the
    /// connection is not open, since a single missing frame is immaterial.
    pub fn send_audio(&self, frame: &[u8]) {
        self.send_json("audio", &RealtimeInputMessage::audio(frame));
    }

    /// One compressed video still, same best-effort policy as audio.
    pub fn send_video(&self, mime_type: &str, frame: &[u8]) {
        self.send_json("video", &RealtimeInputMessage::video(mime_type, frame));
    }

    /// A complete user text turn.
    pub fn send_text(&self, text: &str) {
        self.send_json("text", &ClientContentMessage::user_text(text));
    }

    fn send_json<T: Serialize>(&self, what: &str, msg: &T) {
        if self.state() != ConnState::Open {
            warn!("Dropping {} send, connection not open", what);
            return;
        }
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {} message: {}", what, e);
                return;
            }
        };
        match self.outbound.lock().expect("outbound slot poisoned").as_ref() {
            Some(tx) => {
                let _ = tx.send(Message::Text(json.into()));
            }
            None => warn!("Dropping {} send, connection not open", what),
        }
    }

    fn endpoint_url(&self) -> Result<Url, SessionError> {
        let mut url = Url::parse(&self.config.ws_url)
            .map_err(|e| SessionError::Config(format!("invalid ws_url: {}", e)))?;
        if !self.config.api_key.is_empty() {
            url.query_pairs_mut().append_pair("key", &self.config.api_key);
        }
        Ok(url)
    }
}

async fn write_loop(mut out_rx: mpsc::UnboundedReceiver<Message>, mut write: WsWrite) {
    while let Some(msg) = out_rx.recv().await {
        if let Err(e) = write.send(msg).await {
            warn!("WebSocket send failed: {}", e);
            return;
        }
    }
    // Sender dropped: orderly local close.
    let _ = write.send(Message::Close(None)).await;
}

async fn read_loop(
    mut read: WsRead,
    event_tx: mpsc::Sender<ClientEvent>,
    state_tx: watch::Sender<ConnState>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>,
) {
    let mut close: Option<(Option<u16>, String)> = None;

    'conn: while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => match decode_server_message(&text) {
                Ok(events) => {
                    for event in events {
                        if event_tx.send(event).await.is_err() {
                            break 'conn;
                        }
                    }
                }
                Err(e) => {
                    // Malformed inbound data is reported but does not kill
                    // the connection.
                    warn!("Ignoring inbound message: {}", e);
                    let _ = event_tx
                        .send(ClientEvent::Error(e.to_string()))
                        .await;
                }
            },
            Ok(Message::Close(frame)) => {
                close = Some(match frame {
                    Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                    None => (None, String::new()),
                });
                break;
            }
            Ok(_) => {}
            Err(e) => {
                close = Some((None, e.to_string()));
                break;
            }
        }
    }

    state_tx.send_replace(ConnState::Closed);
    outbound.lock().expect("outbound slot poisoned").take();
    let (code, reason) = close.unwrap_or((None, "connection closed".to_string()));
    info!("WebSocket closed: code={:?} reason={:?}", code, reason);
    let _ = event_tx.send(ClientEvent::Disconnected { code, reason }).await;
}
