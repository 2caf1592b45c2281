//! Hub role: accepts spoke channels and relays between them.
//!
//! Every envelope a peer sends is dispatched to local subscribers and then
//! forwarded to every other peer. The hub never connects outward, so it has
//! no queue and never reconnects; its listener runs until shutdown.

// ============================================================================
// Imports
// ============================================================================

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::identifiers::PeerName;
use crate::protocol::{ContextTag, Envelope};
use crate::transport::{Channel, Port, PortEvent};

use super::{ConnectionState, Role, Shared};

// ============================================================================
// Peer
// ============================================================================

/// One connected spoke.
struct Peer {
    /// Distinguishes a reconnected peer from a stale one with the same name.
    serial: u64,
    /// Context parsed from the peer name; `None` if the name is foreign.
    context: Option<ContextTag>,
    port: Arc<dyn Port>,
}

// ============================================================================
// Hub
// ============================================================================

/// Role of the background context.
pub(crate) struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    shared: Shared,
    peers: RwLock<FxHashMap<PeerName, Peer>>,
    next_serial: AtomicU64,
    started: AtomicBool,
    listening: AtomicBool,
    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Hub {
    pub(crate) fn new(shared: Shared) -> Self {
        Self {
            inner: Arc::new(HubInner {
                shared,
                peers: RwLock::new(FxHashMap::default()),
                next_serial: AtomicU64::new(1),
                started: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Role for Hub {
    fn context(&self) -> ContextTag {
        ContextTag::Background
    }

    fn state(&self) -> ConnectionState {
        if self.inner.listening.load(Ordering::SeqCst) {
            ConnectionState::HubListening
        } else {
            ConnectionState::Uninitialized
        }
    }

    fn setup(&self) {
        if self.inner.closed.load(Ordering::SeqCst) || self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("Hub already listening, skipping");
            return;
        }

        let inner = Arc::clone(&self.inner);
        self.inner.track(self.inner.shared.handle.spawn(async move {
            inner.run().await;
        }));
    }

    fn publish(&self, envelope: Envelope) {
        let sent = self.inner.broadcast(&envelope, None);
        trace!(id = %envelope.id, kind = %envelope.kind, peers = sent, "Hub published");
    }

    fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    fn invalidate_peers(&self) -> usize {
        let peers: Vec<(PeerName, Peer)> = self.inner.peers.write().drain().collect();
        for (name, peer) in &peers {
            debug!(peer = %name, "Invalidating peer");
            peer.port.invalidate();
        }

        info!(peers = peers.len(), "Invalidated all peers");
        peers.len()
    }

    fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.listening.store(false, Ordering::SeqCst);

        let tasks = mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            task.abort();
        }

        let peers: Vec<Peer> = self.inner.peers.write().drain().map(|(_, peer)| peer).collect();
        for peer in &peers {
            peer.port.disconnect();
        }

        debug!(peers = peers.len(), "Hub shut down");
    }
}

// ============================================================================
// HubInner
// ============================================================================

impl HubInner {
    fn track(&self, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Listens and registers inbound channels until the listener ends.
    async fn run(self: Arc<Self>) {
        let mut listener = match self.shared.runtime.listen().await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to start listening");
                self.started.store(false, Ordering::SeqCst);
                return;
            }
        };

        self.listening.store(true, Ordering::SeqCst);
        info!("Hub listening for connections");

        while let Some(channel) = listener.accept().await {
            self.register(channel);
        }

        self.listening.store(false, Ordering::SeqCst);
        debug!("Hub listener closed");
    }

    fn register(self: &Arc<Self>, channel: Channel) {
        let Channel { port, mut events } = channel;

        if self.closed.load(Ordering::SeqCst) {
            port.disconnect();
            return;
        }

        let name = port.name().clone();
        let context = name.context();
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);

        let previous = self.peers.write().insert(
            name.clone(),
            Peer {
                serial,
                context,
                port,
            },
        );
        if let Some(previous) = previous {
            warn!(peer = %name, "Replacing peer with duplicate name");
            previous.port.disconnect();
        }

        info!(peer = %name, context = ?context, "Peer connected");

        let inner = Arc::clone(self);
        self.track(self.shared.handle.spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PortEvent::Message(envelope) => inner.receive(&name, &envelope),
                    PortEvent::Disconnected(reason) => {
                        debug!(peer = %name, %reason, "Peer disconnected");
                        break;
                    }
                }
            }
            inner.remove(&name, serial);
        }));
    }

    fn remove(&self, name: &PeerName, serial: u64) {
        let mut peers = self.peers.write();
        if peers.get(name).is_some_and(|peer| peer.serial == serial) {
            peers.remove(name);
            info!(peer = %name, remaining = peers.len(), "Peer removed");
        }
    }

    fn receive(&self, from: &PeerName, envelope: &Envelope) {
        self.shared.stats.record_received();
        trace!(peer = %from, id = %envelope.id, kind = %envelope.kind, "Received message");

        self.shared.subscribers.dispatch(envelope);
        self.broadcast(envelope, Some(from));
    }

    /// Posts to every addressed peer except `exclude`; returns how many
    /// posts succeeded. One failing peer does not stop the rest.
    fn broadcast(&self, envelope: &Envelope, exclude: Option<&PeerName>) -> usize {
        let targets: Vec<(PeerName, Arc<dyn Port>)> = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(name, _)| exclude != Some(*name))
                .filter(|(_, peer)| envelope.is_addressed_to(peer.context))
                .map(|(name, peer)| (name.clone(), Arc::clone(&peer.port)))
                .collect()
        };

        let mut sent = 0;
        for (name, port) in targets {
            match port.post_message(envelope) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.shared.stats.record_send_failure();
                    warn!(peer = %name, id = %envelope.id, error = %e, "Failed to forward message");
                }
            }
        }

        self.shared.stats.record_sent(sent as u64);
        sent
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::runtime::Handle;
    use tokio::time::{sleep, timeout};

    use crate::bus::{BusStats, Subscribers};
    use crate::config::BusConfig;
    use crate::protocol::MessageKind;
    use crate::transport::{DisconnectReason, HostRuntime, MemoryRuntime};

    fn shared(runtime: &MemoryRuntime) -> Shared {
        Shared {
            runtime: Arc::new(runtime.clone()),
            subscribers: Subscribers::new(),
            stats: Arc::new(BusStats::default()),
            config: BusConfig::default(),
            handle: Handle::current(),
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition reached");
    }

    async fn listening_hub(runtime: &MemoryRuntime) -> Hub {
        let hub = Hub::new(shared(runtime));
        hub.setup();
        wait_until(|| hub.state() == ConnectionState::HubListening).await;
        hub
    }

    async fn recv_message(channel: &mut Channel) -> Envelope {
        match timeout(Duration::from_secs(2), channel.events.recv()).await {
            Ok(Some(PortEvent::Message(envelope))) => envelope,
            other => panic!("expected message, got {other:?}"),
        }
    }

    fn envelope(source: ContextTag, target: Option<ContextTag>) -> Envelope {
        Envelope::new(MessageKind::ElementSelected, json!({ "n": 1 }), source, target, 0)
    }

    #[tokio::test]
    async fn test_setup_is_one_time() {
        let runtime = MemoryRuntime::new();
        let hub = listening_hub(&runtime).await;
        hub.setup();

        assert_eq!(hub.state(), ConnectionState::HubListening);
        assert!(runtime.is_listening());
    }

    #[tokio::test]
    async fn test_relay_skips_origin() {
        let runtime = MemoryRuntime::new();
        let hub = listening_hub(&runtime).await;

        let mut content = runtime
            .connect(&PeerName::generate(ContextTag::Content))
            .await
            .expect("connect content");
        let mut sidepanel = runtime
            .connect(&PeerName::generate(ContextTag::Sidepanel))
            .await
            .expect("connect sidepanel");
        wait_until(|| hub.peer_count() == 2).await;

        let sent = envelope(ContextTag::Content, None);
        content.port.post_message(&sent).expect("post");

        let relayed = recv_message(&mut sidepanel).await;
        assert_eq!(relayed, sent);

        sleep(Duration::from_millis(20)).await;
        assert!(content.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_target_limits_forwarding() {
        let runtime = MemoryRuntime::new();
        let hub = listening_hub(&runtime).await;

        let mut first = runtime
            .connect(&PeerName::generate(ContextTag::Content))
            .await
            .expect("connect content");
        let mut second = runtime
            .connect(&PeerName::generate(ContextTag::Sidepanel))
            .await
            .expect("connect sidepanel");
        wait_until(|| hub.peer_count() == 2).await;

        let sent = envelope(ContextTag::Background, Some(ContextTag::Sidepanel));
        hub.publish(sent.clone());

        assert_eq!(recv_message(&mut second).await.id, sent.id);
        sleep(Duration::from_millis(20)).await;
        assert!(first.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_received_messages_dispatch_locally() {
        let runtime = MemoryRuntime::new();
        let shared = shared(&runtime);
        let subscribers = Arc::clone(&shared.subscribers);
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = Arc::clone(&hits);
            subscribers.subscribe(
                MessageKind::ElementSelected,
                Arc::new(move |_: &Envelope| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        let hub = Hub::new(shared);
        hub.setup();
        wait_until(|| hub.state() == ConnectionState::HubListening).await;

        let content = runtime
            .connect(&PeerName::generate(ContextTag::Content))
            .await
            .expect("connect");
        content
            .port
            .post_message(&envelope(ContextTag::Content, Some(ContextTag::Sidepanel)))
            .expect("post");

        wait_until(|| hits.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn test_disconnected_peer_is_removed() {
        let runtime = MemoryRuntime::new();
        let hub = listening_hub(&runtime).await;

        let content = runtime
            .connect(&PeerName::generate(ContextTag::Content))
            .await
            .expect("connect");
        wait_until(|| hub.peer_count() == 1).await;

        content.port.disconnect();
        wait_until(|| hub.peer_count() == 0).await;
    }

    #[tokio::test]
    async fn test_failed_peer_does_not_block_others() {
        let runtime = MemoryRuntime::new();
        let hub = listening_hub(&runtime).await;

        let broken_name = PeerName::generate(ContextTag::Content);
        let _broken = runtime.connect(&broken_name).await.expect("connect");
        let mut healthy = runtime
            .connect(&PeerName::generate(ContextTag::Sidepanel))
            .await
            .expect("connect");
        wait_until(|| hub.peer_count() == 2).await;

        // Closing the hub end does not notify the hub, so the peer stays
        // registered with a dead port.
        let ports: Vec<_> = hub
            .inner
            .peers
            .read()
            .iter()
            .filter(|(name, _)| **name == broken_name)
            .map(|(_, peer)| Arc::clone(&peer.port))
            .collect();
        assert_eq!(ports.len(), 1);
        for port in ports {
            port.disconnect();
        }

        let sent = envelope(ContextTag::Background, None);
        hub.publish(sent.clone());

        assert_eq!(recv_message(&mut healthy).await.id, sent.id);
        assert_eq!(hub.inner.shared.stats.snapshot().send_failures, 1);
        assert_eq!(hub.peer_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_peers_notifies_spokes() {
        let runtime = MemoryRuntime::new();
        let hub = listening_hub(&runtime).await;

        let mut content = runtime
            .connect(&PeerName::generate(ContextTag::Content))
            .await
            .expect("connect");
        wait_until(|| hub.peer_count() == 1).await;

        assert_eq!(hub.invalidate_peers(), 1);
        assert_eq!(hub.peer_count(), 0);
        assert!(matches!(
            content.events.recv().await,
            Some(PortEvent::Disconnected(DisconnectReason::Invalidated))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_peers() {
        let runtime = MemoryRuntime::new();
        let hub = listening_hub(&runtime).await;

        let mut content = runtime
            .connect(&PeerName::generate(ContextTag::Content))
            .await
            .expect("connect");
        wait_until(|| hub.peer_count() == 1).await;

        hub.shutdown();
        assert_eq!(hub.peer_count(), 0);
        assert_ne!(hub.state(), ConnectionState::HubListening);
        assert!(matches!(
            content.events.recv().await,
            Some(PortEvent::Disconnected(_))
        ));
    }
}
