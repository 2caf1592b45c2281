//! Publish/subscribe bus across extension contexts.
//!
//! # Roles
//!
//! | Role | Context | Behavior |
//! |------|---------|----------|
//! | `Hub` | `background` | Accepts channels, dispatches locally, rebroadcasts to other peers |
//! | `Spoke` | `content`, `sidepanel` | One channel to the hub, queues while disconnected, reconnects |
//!
//! Both roles sit behind the internal `Role` interface; the
//! [`ConnectionManager`] builds the right one from its context tag and
//! rebuilds it when the tag changes.
//!
//! # Spoke State Machine
//!
//! ```text
//! Uninitialized ──setup──► Connecting ──ok──► Connected
//!                              ▲  │               │
//!                   backoff    │  └─fail─┐        │ disconnect (closed)
//!                              │         ▼        ▼
//!                              └──── Disconnected ◄┘
//!
//!                 any disconnect (invalidated) ──► Invalidated (terminal)
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use tokio::runtime::Handle;

use crate::config::BusConfig;
use crate::protocol::{ContextTag, Envelope};
use crate::transport::HostRuntime;

// ============================================================================
// Submodules
// ============================================================================

/// Subscriber registry and dispatch.
pub mod dispatch;

/// Hub role.
mod hub;

/// Public façade.
pub mod manager;

/// Outbound queue.
pub mod queue;

/// Spoke role.
mod spoke;

/// Delivery counters.
pub mod stats;

// ============================================================================
// Re-exports
// ============================================================================

pub use dispatch::{Handler, Subscribers, Subscription};
pub use manager::{ConnectionManager, ConnectionManagerBuilder};
pub use queue::{Flush, OutboundQueue};
pub use stats::{BusStats, StatsSnapshot};

// ============================================================================
// ConnectionState
// ============================================================================

/// Observable connection state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Role built, setup not yet run.
    Uninitialized,
    /// Spoke waiting for a connection attempt to resolve.
    Connecting,
    /// Spoke holds a live channel.
    Connected,
    /// Spoke has no channel. A reconnect is scheduled unless the role was
    /// shut down.
    Disconnected,
    /// Spoke's context is gone; no further attempts.
    Invalidated,
    /// Hub accepting inbound channels.
    HubListening,
}

// ============================================================================
// Shared
// ============================================================================

/// Collaborators every role of one manager shares.
#[derive(Clone)]
pub(crate) struct Shared {
    pub(crate) runtime: Arc<dyn HostRuntime>,
    pub(crate) subscribers: Arc<Subscribers>,
    pub(crate) stats: Arc<BusStats>,
    pub(crate) config: BusConfig,
    /// Runtime the manager was built on; every role task is spawned here.
    pub(crate) handle: Handle,
}

// ============================================================================
// Role
// ============================================================================

/// Behavior that differs between hub and spoke.
pub(crate) trait Role: Send + Sync {
    /// Context this role was built for.
    fn context(&self) -> ContextTag;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Starts listening (hub) or schedules the first connection (spoke).
    /// Calling it again is a no-op.
    fn setup(&self);

    /// Delivers a locally created envelope. Never fails.
    fn publish(&self, envelope: Envelope);

    /// Envelopes waiting for a channel.
    fn queued(&self) -> usize {
        0
    }

    /// Connected peers (hub only).
    fn peer_count(&self) -> usize {
        0
    }

    /// Drops every peer with an invalidation notice (hub only); returns how
    /// many were dropped.
    fn invalidate_peers(&self) -> usize {
        0
    }

    /// Cancels timers and closes channels. The role is unusable afterwards.
    fn shutdown(&self);
}

/// Builds the role matching `context`.
pub(crate) fn role_for(context: ContextTag, shared: Shared) -> Box<dyn Role> {
    if context.is_hub() {
        Box::new(hub::Hub::new(shared))
    } else {
        Box::new(spoke::Spoke::new(context, shared))
    }
}
