//! Extension Bus - Hub-and-spoke messaging between browser extension contexts.
//!
//! Browser extension contexts (background, content scripts, side panel) share
//! no memory and talk only through host-provided message channels. This crate
//! layers a publish/subscribe bus on top of those channels.
//!
//! # Architecture
//!
//! - **Hub** (`background`): accepts channels from every other context,
//!   dispatches what it receives to local subscribers and relays it to all
//!   other peers
//! - **Spoke** (`content`, `sidepanel`): one channel to the hub, a FIFO queue
//!   while disconnected, fixed-delay reconnection
//!
//! Key design principles:
//!
//! - Publishing is fire-and-forget: [`ConnectionManager::send_message`] never
//!   fails, transport failures are logged and counted in [`BusStats`]
//! - An invalidated context stops reconnecting for good
//! - The host is abstracted behind [`HostRuntime`]; [`MemoryRuntime`] runs
//!   in-process, [`WsRuntime`] over WebSocket
//!
//! # Quick Start
//!
//! ```no_run
//! use extension_bus::{ConnectionManager, ContextTag, MemoryRuntime, MessageKind, Result};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let runtime = MemoryRuntime::new();
//!
//!     let background = ConnectionManager::builder()
//!         .runtime(runtime.clone())
//!         .context(ContextTag::Background)
//!         .build()?;
//!
//!     let sidepanel = ConnectionManager::builder()
//!         .runtime(runtime)
//!         .context(ContextTag::Sidepanel)
//!         .build()?;
//!
//!     background.subscribe(MessageKind::Debug, |envelope| {
//!         println!("{} from {}", envelope.kind, envelope.source);
//!     });
//!
//!     sidepanel.send_message(MessageKind::SidePanelReady, json!({}), None);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bus`] | Manager, roles, dispatch, queue, counters |
//! | [`config`] | Delays and queue bound |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Envelope ids, peer names, subscription ids |
//! | [`protocol`] | Envelope, kinds, typed payloads |
//! | [`transport`] | Host runtime abstraction and implementations |

// ============================================================================
// Modules
// ============================================================================

/// Publish/subscribe bus.
///
/// Use [`ConnectionManager::builder()`] to create an endpoint.
pub mod bus;

/// Bus configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Identifier newtypes.
pub mod identifiers;

/// Wire types.
pub mod protocol;

/// Host runtime abstraction.
///
/// Channels between contexts come from a [`HostRuntime`]; the bus never
/// talks to a transport directly.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Bus types
pub use bus::{
    BusStats, ConnectionManager, ConnectionManagerBuilder, ConnectionState, Handler, StatsSnapshot,
    Subscription,
};

// Configuration
pub use config::{BusConfig, OverflowPolicy};

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{EnvelopeId, PeerName, SubscriptionId};

// Protocol types
pub use protocol::{
    ContextTag, ElementInfo, ElementTreeNode, Envelope, MessageKind, SelectElementPayload,
    SelectionModePayload, TabActivatedPayload,
};

// Transport types
pub use transport::{DisconnectReason, HostRuntime, MemoryRuntime, Port, WsRuntime};
