//! In-process host runtime.
//!
//! Connects spokes and the hub living in the same process through unbounded
//! channels. Every posted envelope is serialized to JSON and parsed back, so
//! anything that would not survive the real wire fails here too.
//!
//! The runtime doubles as a test harness: it counts connection attempts,
//! records which envelopes spokes delivered, and can inject failures.
//!
//! # Example
//!
//! ```ignore
//! let runtime = MemoryRuntime::new();
//! let hub = ConnectionManager::builder()
//!     .runtime(runtime.clone())
//!     .context(ContextTag::Background)
//!     .build()?;
//!
//! runtime.fail_next_connects(2);   // first two spoke attempts fail
//! runtime.limit_posts(3);          // fourth post from a spoke fails
//! runtime.invalidate();            // every spoke sees an invalidated context
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{from_str, to_string};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identifiers::{EnvelopeId, PeerName};
use crate::protocol::Envelope;

use super::{Channel, DisconnectReason, HostRuntime, Listener, Port, PortEvent};

// ============================================================================
// Types
// ============================================================================

/// Which end of a link a port sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Spoke,
    Hub,
}

/// Both ends of one open channel.
struct Link {
    spoke: Arc<MemoryPort>,
    hub: Arc<MemoryPort>,
}

/// Injected failures.
#[derive(Debug, Default)]
struct Faults {
    /// Number of upcoming connects that fail.
    failing_connects: u32,
    /// Remaining successful spoke posts; `None` is unlimited.
    post_budget: Option<u64>,
}

#[derive(Default)]
struct RuntimeState {
    listener: Mutex<Option<mpsc::UnboundedSender<Channel>>>,
    links: Mutex<FxHashMap<PeerName, Link>>,
    faults: Mutex<Faults>,
    delivered: Mutex<Vec<(PeerName, EnvelopeId)>>,
    connect_attempts: AtomicU64,
    invalidated: AtomicBool,
}

// ============================================================================
// MemoryRuntime
// ============================================================================

/// In-process [`HostRuntime`].
///
/// Cheap to clone; clones share the same links and counters.
#[derive(Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<RuntimeState>,
}

impl MemoryRuntime {
    /// Creates a runtime with no listener.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total `connect` calls, including failed ones.
    #[inline]
    #[must_use]
    pub fn connect_attempts(&self) -> u64 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of open links.
    #[inline]
    #[must_use]
    pub fn link_count(&self) -> usize {
        self.state.links.lock().len()
    }

    /// Returns `true` once a hub is listening.
    #[inline]
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state.listener.lock().is_some()
    }

    /// Names of the open links, in no particular order.
    #[must_use]
    pub fn peer_names(&self) -> Vec<PeerName> {
        self.state.links.lock().keys().cloned().collect()
    }

    /// Ids of envelopes spokes delivered to the hub, in delivery order.
    #[must_use]
    pub fn delivered(&self) -> Vec<EnvelopeId> {
        self.state
            .delivered
            .lock()
            .iter()
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.faults.lock().failing_connects = count;
    }

    /// Lets spokes post `budget` more envelopes, then fails every post.
    pub fn limit_posts(&self, budget: u64) {
        self.state.faults.lock().post_budget = Some(budget);
    }

    /// Removes the post limit.
    pub fn clear_post_limit(&self) {
        self.state.faults.lock().post_budget = None;
    }

    /// Closes one link. The spoke end sees `reason`, the hub end `Closed`.
    ///
    /// Returns `false` if no such link exists.
    pub fn sever(&self, name: &PeerName, reason: DisconnectReason) -> bool {
        let Some(link) = self.state.links.lock().remove(name) else {
            return false;
        };

        debug!(peer = %name, %reason, "Severing memory link");

        link.spoke.close_local(reason);
        link.hub.close_local(DisconnectReason::Closed);
        true
    }

    /// Severs every link and makes further connects fail as invalidated.
    pub fn invalidate(&self) {
        self.state.invalidated.store(true, Ordering::SeqCst);

        for name in self.peer_names() {
            self.sever(&name, DisconnectReason::Invalidated);
        }
    }
}

// ============================================================================
// MemoryRuntime - HostRuntime
// ============================================================================

#[async_trait]
impl HostRuntime for MemoryRuntime {
    async fn connect(&self, name: &PeerName) -> Result<Channel> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.state.invalidated.load(Ordering::SeqCst) {
            return Err(Error::ContextInvalidated);
        }

        {
            let mut faults = self.state.faults.lock();
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                return Err(Error::connection("Injected connect failure"));
            }
        }

        let listener = self.state.listener.lock().clone().ok_or_else(|| {
            Error::connection("Could not establish connection. Receiving end does not exist.")
        })?;

        let (spoke_tx, spoke_rx) = mpsc::unbounded_channel();
        let (hub_tx, hub_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let spoke = Arc::new(MemoryPort {
            name: name.clone(),
            side: Side::Spoke,
            remote_tx: hub_tx.clone(),
            local_tx: spoke_tx.clone(),
            closed: Arc::clone(&closed),
            runtime: Arc::clone(&self.state),
        });
        let hub = Arc::new(MemoryPort {
            name: name.clone(),
            side: Side::Hub,
            remote_tx: spoke_tx,
            local_tx: hub_tx,
            closed,
            runtime: Arc::clone(&self.state),
        });

        listener
            .send(Channel {
                port: Arc::clone(&hub) as Arc<dyn Port>,
                events: hub_rx,
            })
            .map_err(|_| Error::connection("Hub stopped listening"))?;

        self.state.links.lock().insert(
            name.clone(),
            Link {
                spoke: Arc::clone(&spoke),
                hub,
            },
        );

        debug!(peer = %name, "Memory link opened");

        Ok(Channel {
            port: spoke,
            events: spoke_rx,
        })
    }

    async fn listen(&self) -> Result<Box<dyn Listener>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.listener.lock() = Some(tx);

        debug!("Memory runtime listening");

        Ok(Box::new(MemoryListener { inbound: rx }))
    }
}

// ============================================================================
// MemoryListener
// ============================================================================

/// Inbound side handed to the hub.
struct MemoryListener {
    inbound: mpsc::UnboundedReceiver<Channel>,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&mut self) -> Option<Channel> {
        self.inbound.recv().await
    }
}

// ============================================================================
// MemoryPort
// ============================================================================

/// One end of an in-process link.
pub struct MemoryPort {
    name: PeerName,
    side: Side,
    /// Events for the other end.
    remote_tx: mpsc::UnboundedSender<PortEvent>,
    /// Events for this end (used when the runtime severs the link).
    local_tx: mpsc::UnboundedSender<PortEvent>,
    /// Shared by both ends.
    closed: Arc<AtomicBool>,
    runtime: Arc<RuntimeState>,
}

impl MemoryPort {
    /// Marks the link closed and tells this end why.
    fn close_local(&self, reason: DisconnectReason) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.local_tx.send(PortEvent::Disconnected(reason));
    }

    /// Consumes one unit of the post budget.
    fn take_post_budget(&self) -> Result<()> {
        let mut faults = self.runtime.faults.lock();
        match faults.post_budget.as_mut() {
            Some(0) => Err(Error::connection("Injected post failure")),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl Port for MemoryPort {
    fn name(&self) -> &PeerName {
        &self.name
    }

    fn post_message(&self, envelope: &Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        if self.side == Side::Spoke {
            self.take_post_budget()?;
        }

        // Same trip a real host makes: structured clone through JSON.
        let wire = to_string(envelope)?;
        let received: Envelope = from_str(&wire)?;

        self.remote_tx
            .send(PortEvent::Message(received))
            .map_err(|_| Error::ConnectionClosed)?;

        if self.side == Side::Spoke {
            self.runtime
                .delivered
                .lock()
                .push((self.name.clone(), envelope.id.clone()));
        }

        trace!(peer = %self.name, id = %envelope.id, "Memory post");
        Ok(())
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.runtime.links.lock().remove(&self.name);
        let _ = self
            .remote_tx
            .send(PortEvent::Disconnected(DisconnectReason::Closed));

        debug!(peer = %self.name, side = ?self.side, "Memory port disconnected");
    }

    fn invalidate(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.runtime.links.lock().remove(&self.name);
        let _ = self
            .remote_tx
            .send(PortEvent::Disconnected(DisconnectReason::Invalidated));
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::protocol::{ContextTag, MessageKind};

    fn envelope(kind: MessageKind) -> Envelope {
        Envelope::new(kind, json!({ "n": 1 }), ContextTag::Content, None, 0)
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let runtime = MemoryRuntime::new();
        let result = runtime.connect(&PeerName::generate(ContextTag::Content)).await;

        assert!(matches!(result, Err(Error::Connection { .. })));
        assert_eq!(runtime.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_post_reaches_hub() {
        let runtime = MemoryRuntime::new();
        let mut listener = runtime.listen().await.expect("listen");

        let name = PeerName::generate(ContextTag::Content);
        let spoke = runtime.connect(&name).await.expect("connect");
        let mut hub = listener.accept().await.expect("inbound channel");
        assert_eq!(hub.port.name(), &name);

        let sent = envelope(MessageKind::ContentReady);
        spoke.port.post_message(&sent).expect("post");

        match hub.events.recv().await {
            Some(PortEvent::Message(received)) => assert_eq!(received, sent),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(runtime.delivered(), vec![sent.id]);
    }

    #[tokio::test]
    async fn test_injected_connect_failures() {
        let runtime = MemoryRuntime::new();
        let _listener = runtime.listen().await.expect("listen");
        runtime.fail_next_connects(1);

        let name = PeerName::generate(ContextTag::Sidepanel);
        assert!(runtime.connect(&name).await.is_err());
        assert!(runtime.connect(&name).await.is_ok());
        assert_eq!(runtime.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_post_budget() {
        let runtime = MemoryRuntime::new();
        let _listener = runtime.listen().await.expect("listen");
        let spoke = runtime
            .connect(&PeerName::generate(ContextTag::Content))
            .await
            .expect("connect");

        runtime.limit_posts(1);
        assert!(spoke.port.post_message(&envelope(MessageKind::CaptureTab)).is_ok());
        assert!(spoke.port.post_message(&envelope(MessageKind::CaptureTab)).is_err());

        runtime.clear_post_limit();
        assert!(spoke.port.post_message(&envelope(MessageKind::CaptureTab)).is_ok());
    }

    #[tokio::test]
    async fn test_sever_notifies_both_ends() {
        let runtime = MemoryRuntime::new();
        let mut listener = runtime.listen().await.expect("listen");
        let name = PeerName::generate(ContextTag::Content);
        let mut spoke = runtime.connect(&name).await.expect("connect");
        let mut hub = listener.accept().await.expect("inbound channel");

        assert!(runtime.sever(&name, DisconnectReason::Invalidated));
        assert!(!runtime.sever(&name, DisconnectReason::Closed));

        assert!(matches!(
            spoke.events.recv().await,
            Some(PortEvent::Disconnected(DisconnectReason::Invalidated))
        ));
        assert!(matches!(
            hub.events.recv().await,
            Some(PortEvent::Disconnected(DisconnectReason::Closed))
        ));
        assert!(matches!(
            spoke.port.post_message(&envelope(MessageKind::Debug)),
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_invalidate_blocks_future_connects() {
        let runtime = MemoryRuntime::new();
        let _listener = runtime.listen().await.expect("listen");
        runtime.invalidate();

        let result = runtime.connect(&PeerName::generate(ContextTag::Content)).await;
        assert!(matches!(result, Err(Error::ContextInvalidated)));
    }

    #[tokio::test]
    async fn test_disconnect_only_notifies_remote() {
        let runtime = MemoryRuntime::new();
        let mut listener = runtime.listen().await.expect("listen");
        let name = PeerName::generate(ContextTag::Content);
        let mut spoke = runtime.connect(&name).await.expect("connect");
        let mut hub = listener.accept().await.expect("inbound channel");

        spoke.port.disconnect();
        spoke.port.disconnect();

        assert!(matches!(
            hub.events.recv().await,
            Some(PortEvent::Disconnected(DisconnectReason::Closed))
        ));
        assert!(spoke.events.try_recv().is_err());
        assert_eq!(runtime.link_count(), 0);
    }
}
