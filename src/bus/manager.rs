//! Public façade over the hub and spoke roles.
//!
//! A [`ConnectionManager`] owns one role at a time, chosen from its context
//! tag. Subscriptions live on the manager, so they survive context switches;
//! connections, timers and the outbound queue belong to the role and are
//! discarded with it.
//!
//! # Example
//!
//! ```no_run
//! use extension_bus::{ConnectionManager, ContextTag, MessageKind, MemoryRuntime};
//! use serde_json::json;
//!
//! # async fn example() -> extension_bus::Result<()> {
//! let runtime = MemoryRuntime::new();
//!
//! let background = ConnectionManager::builder()
//!     .runtime(runtime.clone())
//!     .context(ContextTag::Background)
//!     .build()?;
//!
//! let content = ConnectionManager::builder()
//!     .runtime(runtime)
//!     .context(ContextTag::Content)
//!     .build()?;
//!
//! let subscription = background.subscribe(MessageKind::ElementSelected, |envelope| {
//!     println!("selected: {}", envelope.payload);
//! });
//!
//! content.send_message(MessageKind::ElementSelected, json!({ "path": [0, 2] }), None);
//! subscription.dispose();
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::{debug, info, trace};

use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::identifiers::EnvelopeId;
use crate::protocol::{ContextTag, Envelope, EnvelopeClock, MessageKind};
use crate::transport::HostRuntime;

use super::dispatch::{Subscribers, Subscription};
use super::stats::{BusStats, StatsSnapshot};
use super::{ConnectionState, Role, Shared, role_for};

// ============================================================================
// ConnectionManager
// ============================================================================

/// Message bus endpoint for one extension context.
///
/// Create one with [`ConnectionManager::builder()`]. Dropping the manager
/// shuts its role down.
pub struct ConnectionManager {
    shared: Shared,
    clock: EnvelopeClock,
    role: RwLock<Box<dyn Role>>,
}

impl ConnectionManager {
    /// Creates a builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ConnectionManagerBuilder {
        ConnectionManagerBuilder::new()
    }

    /// Switches to `context`.
    ///
    /// Same tag: no-op. Otherwise the current role is shut down (pending
    /// timers cancelled, channels closed, queue discarded) and the role for
    /// `context` is built and set up. Subscriptions are kept.
    pub fn set_context(&self, context: ContextTag) {
        let mut role = self.role.write();

        if role.context() == context {
            debug!(%context, "Context already set, skipping");
            return;
        }

        info!(from = %role.context(), to = %context, "Switching context");

        role.shutdown();
        *role = role_for(context, self.shared.clone());
        role.setup();
    }

    /// Publishes an envelope and returns its id.
    ///
    /// Never fails and never waits: the envelope is posted, queued, or
    /// dropped, and transport failures are only logged and counted in
    /// [`stats`](Self::stats).
    pub fn send_message(
        &self,
        kind: impl Into<MessageKind>,
        payload: Value,
        target: Option<ContextTag>,
    ) -> EnvelopeId {
        let role = self.role.read();

        let envelope = Envelope::new(
            kind.into(),
            payload,
            role.context(),
            target,
            self.clock.now_ms(),
        );
        let id = envelope.id.clone();

        self.shared.stats.record_published();
        trace!(%id, kind = %envelope.kind, target = ?target, "Publishing");

        role.publish(envelope);
        id
    }

    /// Publishes a typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if `payload` cannot be serialized. Delivery
    /// failures are never reported.
    pub fn send<T: Serialize>(
        &self,
        kind: impl Into<MessageKind>,
        payload: &T,
        target: Option<ContextTag>,
    ) -> Result<EnvelopeId> {
        let payload = serde_json::to_value(payload)?;
        Ok(self.send_message(kind, payload, target))
    }

    /// Registers `handler` for `kind`.
    ///
    /// Subscribing to [`MessageKind::Debug`] receives every envelope.
    pub fn subscribe<F>(&self, kind: impl Into<MessageKind>, handler: F) -> Subscription
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.shared.subscribers.subscribe(kind.into(), Arc::new(handler))
    }

    /// Tells every connected spoke its context is gone, as an extension
    /// reload does. Those spokes stop reconnecting for good.
    ///
    /// Returns the number of spokes notified; always `0` outside the
    /// background context.
    pub fn invalidate_peers(&self) -> usize {
        self.role.read().invalidate_peers()
    }

    /// Stops the current role. Later sends are dropped.
    pub fn shutdown(&self) {
        self.role.read().shutdown();
    }
}

// ============================================================================
// ConnectionManager - Accessors
// ============================================================================

impl ConnectionManager {
    /// Returns the current context.
    #[inline]
    #[must_use]
    pub fn context(&self) -> ContextTag {
        self.role.read().context()
    }

    /// Returns the current connection state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.role.read().state()
    }

    /// Returns the number of envelopes waiting for a connection.
    #[inline]
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.role.read().queued()
    }

    /// Returns the number of connected peers (hub only).
    #[inline]
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.role.read().peer_count()
    }

    /// Returns the number of handlers registered for `kind`.
    #[inline]
    #[must_use]
    pub fn handler_count(&self, kind: &MessageKind) -> usize {
        self.shared.subscribers.handler_count(kind)
    }

    /// Returns a snapshot of the delivery counters.
    #[inline]
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("context", &self.context())
            .field("state", &self.state())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.role.get_mut().shutdown();
    }
}

// ============================================================================
// ConnectionManagerBuilder
// ============================================================================

/// Builder for a [`ConnectionManager`].
///
/// The context defaults to [`ContextTag::Content`]; a host runtime is
/// required.
#[derive(Default)]
pub struct ConnectionManagerBuilder {
    runtime: Option<Arc<dyn HostRuntime>>,
    config: BusConfig,
    context: Option<ContextTag>,
}

impl ConnectionManagerBuilder {
    /// Creates a builder with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the host runtime.
    #[inline]
    #[must_use]
    pub fn runtime(mut self, runtime: impl HostRuntime + 'static) -> Self {
        self.runtime = Some(Arc::new(runtime));
        self
    }

    /// Sets a host runtime shared with other code.
    #[inline]
    #[must_use]
    pub fn shared_runtime(mut self, runtime: Arc<dyn HostRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the initial context.
    #[inline]
    #[must_use]
    pub fn context(mut self, context: ContextTag) -> Self {
        self.context = Some(context);
        self
    }

    /// Builds the manager and sets up its role.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if no runtime was set, the configuration is
    ///   invalid, or this is called outside a Tokio runtime
    pub fn build(self) -> Result<ConnectionManager> {
        let runtime = self.runtime.ok_or_else(|| {
            Error::config(
                "Host runtime is required. Use .runtime() to set it.\n\
                 Example: ConnectionManager::builder().runtime(MemoryRuntime::new())",
            )
        })?;

        self.config.validate()?;

        let handle = Handle::try_current().map_err(|_| {
            Error::config("ConnectionManager must be built inside a Tokio runtime")
        })?;

        let context = self.context.unwrap_or(ContextTag::Content);
        let shared = Shared {
            runtime,
            subscribers: Subscribers::new(),
            stats: Arc::new(BusStats::default()),
            config: self.config,
            handle,
        };

        let role = role_for(context, shared.clone());
        role.setup();

        debug!(%context, "Connection manager created");

        Ok(ConnectionManager {
            shared,
            clock: EnvelopeClock::new(),
            role: RwLock::new(role),
        })
    }
}

impl fmt::Debug for ConnectionManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManagerBuilder")
            .field("runtime", &self.runtime.is_some())
            .field("config", &self.config)
            .field("context", &self.context)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
