//! Subscriber registry and local dispatch.
//!
//! Handlers are kept per [`MessageKind`] in registration order. Dispatch
//! invokes the handlers of the envelope's kind, then the `DEBUG` wildcard
//! handlers. The handler lists are snapshotted before any handler runs, so a
//! handler may subscribe or dispose (itself included) without disturbing the
//! current dispatch.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::identifiers::SubscriptionId;
use crate::protocol::{Envelope, MessageKind};

// ============================================================================
// Types
// ============================================================================

/// Callback invoked for each matching envelope.
pub type Handler = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Handlers of one kind, in registration order.
type HandlerList = Vec<(SubscriptionId, Handler)>;

// ============================================================================
// Subscribers
// ============================================================================

/// Mapping from message kind to its ordered handlers.
#[derive(Default)]
pub struct Subscribers {
    handlers: RwLock<FxHashMap<MessageKind, HandlerList>>,
}

impl Subscribers {
    /// Creates an empty registry.
    #[inline]
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers `handler` for `kind`.
    ///
    /// Returns the disposer for exactly this registration.
    pub fn subscribe(self: &Arc<Self>, kind: MessageKind, handler: Handler) -> Subscription {
        let id = SubscriptionId::next();

        self.handlers
            .write()
            .entry(kind.clone())
            .or_default()
            .push((id, handler));

        debug!(%kind, subscription = %id, "Handler subscribed");

        Subscription {
            id,
            kind,
            registry: Arc::downgrade(self),
        }
    }

    /// Invokes every handler for `envelope`; returns how many ran.
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.read();
            let own = handlers.get(&envelope.kind).into_iter().flatten();
            let wildcard = if envelope.kind.is_wildcard() {
                None
            } else {
                handlers.get(&MessageKind::Debug)
            };

            own.chain(wildcard.into_iter().flatten())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        for handler in &snapshot {
            handler(envelope);
        }

        trace!(id = %envelope.id, kind = %envelope.kind, handlers = snapshot.len(), "Dispatched");
        snapshot.len()
    }

    /// Number of handlers registered for `kind` (wildcard not included).
    #[must_use]
    pub fn handler_count(&self, kind: &MessageKind) -> usize {
        self.handlers.read().get(kind).map_or(0, Vec::len)
    }

    /// Removes one registration; `false` if it was already gone.
    fn remove(&self, kind: &MessageKind, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(kind) else {
            return false;
        };

        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;

        if list.is_empty() {
            handlers.remove(kind);
        }

        removed
    }
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.read();
        let mut map = f.debug_map();
        for (kind, list) in handlers.iter() {
            map.entry(kind, &list.len());
        }
        map.finish()
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Disposer for one handler registration.
///
/// Dropping it does **not** unsubscribe; call [`dispose`](Self::dispose).
/// Disposing twice is a no-op.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    kind: MessageKind,
    registry: Weak<Subscribers>,
}

impl Subscription {
    /// Removes the handler. Returns `true` if this call removed it.
    pub fn dispose(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };

        let removed = registry.remove(&self.kind, self.id);
        if removed {
            debug!(kind = %self.kind, subscription = %self.id, "Handler disposed");
        }
        removed
    }

    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Returns the subscribed kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }
}

// ============================================================================
// Tests
// ============================================================================
