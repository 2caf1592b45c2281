//! WebSocket host runtime.
//!
//! Lets contexts living in separate processes share one bus: the hub binds
//! a TCP listener and every spoke opens a WebSocket to it.
//!
//! # Connection Flow
//!
//! 1. Hub binds `ws://<addr>` ([`HostRuntime::listen`])
//! 2. Spoke connects and sends a hello frame `{"name": "content-1729350000000"}`
//! 3. Hub registers the channel under that name
//! 4. Both sides exchange envelopes as JSON text frames
//! 5. A close frame with code [`INVALIDATED_CLOSE_CODE`] tells the spoke its
//!    context is gone; any other close is an ordinary disconnect

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{from_str, to_string};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::identifiers::PeerName;
use crate::protocol::Envelope;

use super::{Channel, DisconnectReason, HostRuntime, Listener, Port, PortEvent};

// ============================================================================
// Constants
// ============================================================================

/// Close code that classifies a disconnect as context invalidation.
pub const INVALIDATED_CLOSE_CODE: u16 = 4001;

/// Time a freshly accepted socket has to send its hello frame.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Hello
// ============================================================================

/// First frame a spoke sends after connecting.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    name: PeerName,
}

// ============================================================================
// WsRuntime
// ============================================================================

/// WebSocket [`HostRuntime`].
///
/// The same value serves both roles: the hub calls `listen`, spokes call
/// `connect`.
#[derive(Debug, Clone)]
pub struct WsRuntime {
    addr: SocketAddr,
}

impl WsRuntime {
    /// Creates a runtime for the given hub address.
    #[inline]
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Creates a runtime for a hub on `127.0.0.1:port`.
    #[inline]
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Returns the hub address.
    #[inline]
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the WebSocket URL spokes connect to.
    ///
    /// Format: `ws://{ip}:{port}`
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

#[async_trait]
impl HostRuntime for WsRuntime {
    async fn connect(&self, name: &PeerName) -> Result<Channel> {
        let url = Url::parse(&self.ws_url())
            .map_err(|e| Error::connection(format!("Invalid hub URL: {e}")))?;

        let (mut ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| Error::connection(format!("WebSocket connect failed: {e}")))?;

        let hello = to_string(&Hello { name: name.clone() })?;
        ws_stream.send(Message::Text(hello.into())).await?;

        debug!(peer = %name, url = %url, "WebSocket channel opened");

        Ok(spawn_channel(ws_stream, name.clone()))
    }

    async fn listen(&self) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(accept_loop(listener, inbound_tx));

        info!(addr = %local_addr, "WebSocket hub listening");

        Ok(Box::new(WsListener {
            local_addr,
            inbound: inbound_rx,
        }))
    }
}

// ============================================================================
// WsListener
// ============================================================================

/// Inbound channels accepted by the hub's accept loop.
pub struct WsListener {
    local_addr: SocketAddr,
    inbound: mpsc::UnboundedReceiver<Channel>,
}

impl WsListener {
    /// Returns the bound address (useful after binding port 0).
    #[inline]
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&mut self) -> Option<Channel> {
        self.inbound.recv().await
    }
}

/// Accepts sockets until the [`WsListener`] is dropped.
async fn accept_loop(listener: TcpListener, inbound_tx: mpsc::UnboundedSender<Channel>) {
    debug!("Accept loop started");

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            () = inbound_tx.closed() => break,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Accept failed");
                continue;
            }
        };

        let inbound_tx = inbound_tx.clone();
        tokio::spawn(async move {
            match handshake(stream).await {
                Ok(channel) => {
                    info!(peer = %channel.port.name(), ?addr, "WebSocket peer connected");
                    let _ = inbound_tx.send(channel);
                }
                Err(e) => warn!(error = %e, ?addr, "WebSocket handshake failed"),
            }
        });
    }

    debug!("Accept loop terminated");
}

/// Upgrades a socket and reads the hello frame.
async fn handshake(stream: TcpStream) -> Result<Channel> {
    let mut ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

    let first = timeout(HELLO_TIMEOUT, ws_stream.next())
        .await
        .map_err(|_| Error::protocol("No hello frame received"))?;

    let hello: Hello = match first {
        Some(Ok(Message::Text(text))) => from_str(&text)?,
        Some(Ok(other)) => {
            return Err(Error::protocol(format!("Expected hello frame, got {other:?}")));
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(Error::ConnectionClosed),
    };

    Ok(spawn_channel(ws_stream, hello.name))
}

// ============================================================================
// WsPort
// ============================================================================

/// Sending half of a WebSocket channel.
///
/// Frames go through an unbounded queue to a writer task, so posting
/// never waits on the socket.
pub struct WsPort {
    name: PeerName,
    outgoing: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl WsPort {
    fn close_with(&self, code: CloseCode) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        let _ = self.outgoing.send(Message::Close(Some(frame)));
    }
}

impl Port for WsPort {
    fn name(&self) -> &PeerName {
        &self.name
    }

    fn post_message(&self, envelope: &Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let json = to_string(envelope)?;
        self.outgoing
            .send(Message::Text(json.into()))
            .map_err(|_| Error::ConnectionClosed)?;

        trace!(peer = %self.name, id = %envelope.id, "Frame queued");
        Ok(())
    }

    fn disconnect(&self) {
        self.close_with(CloseCode::Normal);
    }

    fn invalidate(&self) {
        self.close_with(CloseCode::from(INVALIDATED_CLOSE_CODE));
    }
}

// ============================================================================
// Channel Tasks
// ============================================================================

/// Splits a socket into a [`Channel`] backed by a reader and a writer task.
fn spawn_channel<S>(ws_stream: WebSocketStream<S>, name: PeerName) -> Channel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    // Writer
    let writer_name = name.clone();
    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let is_close = matches!(message, Message::Close(_));

            if let Err(e) = ws_write.send(message).await {
                debug!(peer = %writer_name, error = %e, "WebSocket write failed");
                break;
            }

            if is_close {
                break;
            }
        }
    });

    // Reader
    let reader_name = name.clone();
    let reader_closed = Arc::clone(&closed);
    tokio::spawn(async move {
        let reason = loop {
            match ws_read.next().await {
                Some(Ok(Message::Text(text))) => match from_str::<Envelope>(&text) {
                    Ok(envelope) => {
                        if event_tx.send(PortEvent::Message(envelope)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(peer = %reader_name, error = %e, "Dropping malformed frame"),
                },

                Some(Ok(Message::Close(frame))) => break classify_close(frame.as_ref()),

                Some(Err(e)) => break DisconnectReason::Unknown(e.to_string()),

                None => break DisconnectReason::Closed,

                // Ignore Binary, Ping, Pong
                Some(Ok(_)) => {}
            }
        };

        reader_closed.store(true, Ordering::SeqCst);
        debug!(peer = %reader_name, %reason, "WebSocket channel closed");
        let _ = event_tx.send(PortEvent::Disconnected(reason));
    });

    Channel {
        port: Arc::new(WsPort {
            name,
            outgoing: outgoing_tx,
            closed,
        }),
        events: event_rx,
    }
}

/// Maps a close frame onto a [`DisconnectReason`].
fn classify_close(frame: Option<&CloseFrame>) -> DisconnectReason {
    match frame {
        Some(frame) if u16::from(frame.code) == INVALIDATED_CLOSE_CODE => {
            DisconnectReason::Invalidated
        }
        _ => DisconnectReason::Closed,
    }
}

// ============================================================================
// Tests
// ============================================================================
