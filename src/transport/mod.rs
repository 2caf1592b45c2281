//! Host transport abstraction.
//!
//! The bus only needs a minimal named-channel primitive from its host:
//! open a channel by name, post envelopes on it, receive envelopes from it,
//! and learn why it went away.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  connect(name)   ┌──────────────────┐   Listener   ┌──────────────┐
//! │ Spoke        │ ───────────────► │   HostRuntime    │ ───────────► │ Hub          │
//! │ (content,    │ ◄── Channel ──── │ (memory / ws)    │ ── Channel ─►│ (background) │
//! │  sidepanel)  │   Port + events  └──────────────────┘              └──────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `memory` | In-process host with fault injection |
//! | `websocket` | WebSocket host over `tokio-tungstenite` |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::identifiers::PeerName;
use crate::protocol::Envelope;

// ============================================================================
// Submodules
// ============================================================================

/// In-process host runtime.
pub mod memory;

/// WebSocket host runtime.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::{MemoryPort, MemoryRuntime};
pub use websocket::{INVALIDATED_CLOSE_CODE, WsRuntime};

// ============================================================================
// DisconnectReason
// ============================================================================

/// Why a channel closed, as classified by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Ordinary severance; the other side may come back.
    Closed,
    /// The owning context is gone; reconnecting is pointless.
    Invalidated,
    /// Transport failure with the host's description.
    Unknown(String),
}

impl DisconnectReason {
    /// Returns `true` if the context was invalidated.
    #[inline]
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::Invalidated)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("closed"),
            Self::Invalidated => f.write_str("context invalidated"),
            Self::Unknown(message) => write!(f, "unknown: {message}"),
        }
    }
}

// ============================================================================
// PortEvent
// ============================================================================

/// Notification delivered on a channel's event stream.
#[derive(Debug, Clone)]
pub enum PortEvent {
    /// An envelope arrived.
    Message(Envelope),
    /// The channel closed. No further events follow.
    Disconnected(DisconnectReason),
}

// ============================================================================
// Port
// ============================================================================

/// Sending half of one channel.
pub trait Port: Send + Sync {
    /// Name the channel was opened with.
    fn name(&self) -> &PeerName;

    /// Posts an envelope without waiting for delivery.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`](crate::Error::ConnectionClosed) if the
    ///   channel is already gone
    /// - any transport failure reported by the host
    fn post_message(&self, envelope: &Envelope) -> Result<()>;

    /// Closes the channel. The other side sees
    /// [`DisconnectReason::Closed`]; this side gets no event.
    fn disconnect(&self);

    /// Closes the channel telling the other side its context is gone, so it
    /// stops reconnecting. Hosts without such a signal fall back to
    /// [`disconnect`](Self::disconnect).
    fn invalidate(&self) {
        self.disconnect();
    }
}

// ============================================================================
// Channel
// ============================================================================

/// An open channel: the port to post on and the stream of events from it.
pub struct Channel {
    /// Sending half.
    pub port: Arc<dyn Port>,
    /// Receiving half.
    pub events: mpsc::UnboundedReceiver<PortEvent>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", self.port.name())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Source of inbound channels for the hub.
#[async_trait]
pub trait Listener: Send {
    /// Waits for the next inbound channel; `None` once the host stops.
    async fn accept(&mut self) -> Option<Channel>;
}

// ============================================================================
// HostRuntime
// ============================================================================

/// The host-provided channel primitive.
#[async_trait]
pub trait HostRuntime: Send + Sync {
    /// Opens a channel to the hub.
    ///
    /// # Errors
    ///
    /// - [`Error::ContextInvalidated`](crate::Error::ContextInvalidated) if
    ///   this context can never connect again
    /// - [`Error::Connection`](crate::Error::Connection) for transient failures
    async fn connect(&self, name: &PeerName) -> Result<Channel>;

    /// Starts accepting inbound channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot listen (e.g. address in use).
    async fn listen(&self) -> Result<Box<dyn Listener>>;
}
