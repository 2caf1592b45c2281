//! Spoke role: a single outbound channel to the hub.
//!
//! Publishing posts straight to the live channel or parks the envelope in
//! the outbound queue; while anything is queued, new envelopes queue behind
//! it. Every successful connection flushes the queue, and a flush cut short
//! by a dead channel reconnects to send the rest. An ordinary disconnect
//! schedules exactly one reconnect after the backoff delay; an invalidated
//! context stops all further attempts.

// ============================================================================
// Imports
// ============================================================================

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::error::Error;
use crate::identifiers::PeerName;
use crate::protocol::{ContextTag, Envelope};
use crate::transport::{Channel, DisconnectReason, Port, PortEvent};

use super::queue::OutboundQueue;
use super::{ConnectionState, Role, Shared};

// ============================================================================
// SpokeState
// ============================================================================

/// Mutable connection state, guarded by one lock.
struct SpokeState {
    phase: ConnectionState,
    port: Option<Arc<dyn Port>>,
    /// Bumped whenever the current channel changes; events carrying an
    /// older serial belong to a dead channel and are ignored.
    serial: u64,
    queue: OutboundQueue,
    /// Latch so concurrent setup calls schedule a single attempt.
    setting_up: bool,
    reconnect_pending: bool,
    closed: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl SpokeState {
    fn is_invalidated(&self) -> bool {
        self.phase == ConnectionState::Invalidated
    }

    /// Keeps a handle so shutdown can cancel the task.
    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(task);
    }
}

// ============================================================================
// Spoke
// ============================================================================

/// Role of every non-background context.
pub(crate) struct Spoke {
    inner: Arc<SpokeInner>,
}

struct SpokeInner {
    context: ContextTag,
    shared: Shared,
    state: Mutex<SpokeState>,
}

impl Spoke {
    pub(crate) fn new(context: ContextTag, shared: Shared) -> Self {
        let queue = OutboundQueue::from_config(&shared.config);

        Self {
            inner: Arc::new(SpokeInner {
                context,
                shared,
                state: Mutex::new(SpokeState {
                    phase: ConnectionState::Uninitialized,
                    port: None,
                    serial: 0,
                    queue,
                    setting_up: false,
                    reconnect_pending: false,
                    closed: false,
                    tasks: Vec::new(),
                }),
            }),
        }
    }
}

impl Role for Spoke {
    fn context(&self) -> ContextTag {
        self.inner.context
    }

    fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    fn setup(&self) {
        let mut state = self.inner.state.lock();
        if state.setting_up || state.closed {
            debug!(context = %self.inner.context, "Setup already in progress, skipping");
            return;
        }

        state.setting_up = true;
        state.phase = ConnectionState::Connecting;

        let delay = self.inner.shared.config.initial_connect_delay;
        debug!(
            context = %self.inner.context,
            delay_ms = delay.as_millis() as u64,
            "Scheduling initial connection"
        );

        let inner = Arc::clone(&self.inner);
        state.track(self.inner.shared.handle.spawn(async move {
            sleep(delay).await;
            inner.connect().await;
        }));
    }

    fn publish(&self, envelope: Envelope) {
        self.inner.publish(envelope);
    }

    fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    fn shutdown(&self) {
        let (tasks, port, dropped) = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.serial += 1;
            if !state.is_invalidated() {
                state.phase = ConnectionState::Disconnected;
            }
            (
                mem::take(&mut state.tasks),
                state.port.take(),
                state.queue.clear(),
            )
        };

        for task in tasks {
            task.abort();
        }

        if let Some(port) = port {
            port.disconnect();
        }

        if dropped > 0 {
            warn!(context = %self.inner.context, dropped, "Discarding queued messages");
        }

        debug!(context = %self.inner.context, "Spoke shut down");
    }
}

// ============================================================================
// SpokeInner - Connection Lifecycle
// ============================================================================

impl SpokeInner {
    /// One connection attempt.
    async fn connect(self: Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.reconnect_pending = false;
            if state.closed || state.is_invalidated() {
                return;
            }
            state.phase = ConnectionState::Connecting;
        }

        let name = PeerName::generate(self.context);
        self.shared.stats.record_connect_attempt();
        debug!(context = %self.context, peer = %name, "Attempting to connect");

        match self.shared.runtime.connect(&name).await {
            Ok(channel) => self.install(channel),
            Err(Error::ContextInvalidated) => self.invalidate(),
            Err(e) => {
                error!(context = %self.context, error = %e, "Connection error");
                self.state.lock().phase = ConnectionState::Disconnected;
                self.schedule_reconnect();
            }
        }
    }

    /// Adopts a freshly opened channel and flushes the queue over it.
    fn install(self: &Arc<Self>, channel: Channel) {
        let Channel { port, mut events } = channel;
        let mut state = self.state.lock();

        if state.closed || state.is_invalidated() {
            port.disconnect();
            return;
        }

        state.serial += 1;
        let serial = state.serial;
        state.port = Some(Arc::clone(&port));
        state.phase = ConnectionState::Connected;

        info!(context = %self.context, peer = %port.name(), "Connected");

        let inner = Arc::clone(self);
        state.track(self.shared.handle.spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PortEvent::Message(envelope) => inner.receive(&envelope),
                    PortEvent::Disconnected(reason) => {
                        inner.handle_disconnect(serial, reason);
                        return;
                    }
                }
            }
            inner.handle_disconnect(serial, DisconnectReason::Closed);
        }));

        if state.queue.is_empty() {
            return;
        }

        debug!(queued = state.queue.len(), "Flushing message queue");
        loop {
            let flush = state.queue.flush(&*port);
            self.shared.stats.record_sent(flush.sent as u64);

            let Some(e) = flush.failure else {
                return;
            };

            self.shared.stats.record_send_failure();
            error!(
                error = %e,
                sent = flush.sent,
                remaining = flush.remaining,
                "Failed to send queued message"
            );

            if e.is_connection_error() {
                // The rest waits for the next channel.
                state.port = None;
                state.serial += 1;
                state.phase = ConnectionState::Disconnected;
                drop(state);

                port.disconnect();
                self.schedule_reconnect();
                return;
            }

            // The head can never be sent; skip it so the rest can go.
            if let Some(skipped) = state.queue.pop_front() {
                self.shared.stats.record_dropped();
                warn!(id = %skipped.id, kind = %skipped.kind, "Dropping unsendable queued message");
            }
        }
    }

    fn receive(&self, envelope: &Envelope) {
        self.shared.stats.record_received();
        trace!(id = %envelope.id, kind = %envelope.kind, source = %envelope.source, "Received message");
        self.shared.subscribers.dispatch(envelope);
    }

    fn handle_disconnect(self: &Arc<Self>, serial: u64, reason: DisconnectReason) {
        {
            let mut state = self.state.lock();
            if state.closed || state.serial != serial {
                return;
            }

            state.port = None;

            if reason.is_invalidated() {
                drop(state);
                self.invalidate();
                return;
            }

            state.phase = ConnectionState::Disconnected;
            debug!(context = %self.context, %reason, "Disconnected");
        }

        self.schedule_reconnect();
    }

    /// Enters the terminal state.
    fn invalidate(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.port = None;
            state.phase = ConnectionState::Invalidated;
            state.queue.clear()
        };

        self.shared.stats.record_dropped_n(dropped as u64);

        info!(context = %self.context, dropped, "Context invalidated, stopping reconnection");
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.closed || state.is_invalidated() || state.reconnect_pending {
            return;
        }

        state.reconnect_pending = true;
        self.shared.stats.record_reconnect_scheduled();

        let delay = self.shared.config.reconnect_delay;
        debug!(
            context = %self.context,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnection"
        );

        let inner = Arc::clone(self);
        state.track(self.shared.handle.spawn(async move {
            sleep(delay).await;
            inner.connect().await;
        }));
    }
}

// ============================================================================
// SpokeInner - Publishing
// ============================================================================

impl SpokeInner {
    fn publish(self: &Arc<Self>, envelope: Envelope) {
        let mut state = self.state.lock();

        if state.closed || state.is_invalidated() {
            self.shared.stats.record_dropped();
            warn!(id = %envelope.id, kind = %envelope.kind, "Context invalidated, dropping message");
            return;
        }

        // Queued envelopes go out first.
        let live = if state.queue.is_empty() {
            state.port.clone()
        } else {
            None
        };

        if let Some(port) = live {
            match port.post_message(&envelope) {
                Ok(()) => {
                    self.shared.stats.record_sent(1);
                    trace!(id = %envelope.id, kind = %envelope.kind, "Message sent");
                }
                Err(e) => {
                    self.shared.stats.record_send_failure();
                    error!(id = %envelope.id, error = %e, "Send error");

                    if e.is_connection_error() {
                        state.port = None;
                        state.serial += 1;
                        state.phase = ConnectionState::Disconnected;
                        drop(state);

                        port.disconnect();
                        self.schedule_reconnect();
                    }
                }
            }
            return;
        }

        let id = envelope.id.clone();
        if let Some(evicted) = state.queue.push(envelope) {
            self.shared.stats.record_dropped();
            warn!(evicted = %evicted.id, "Outbound queue full, dropped message");
            if evicted.id == id {
                return;
            }
        }

        self.shared.stats.record_queued();
        debug!(%id, queued = state.queue.len(), "Message queued");
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
    use tokio::time::timeout;

    use crate::bus::{BusStats, Subscribers};
    use crate::config::BusConfig;
    use crate::protocol::MessageKind;
    use crate::transport::{HostRuntime, MemoryRuntime};

    fn shared(runtime: &MemoryRuntime) -> Shared {
        Shared {
            runtime: Arc::new(runtime.clone()),
            subscribers: Subscribers::new(),
            stats: Arc::new(BusStats::default()),
            config: BusConfig::new()
                .with_initial_connect_delay(Duration::from_millis(1))
                .with_reconnect_delay(Duration::from_millis(10)),
            handle: Handle::current(),
        }
    }

    fn envelope() -> Envelope {
        Envelope::new(
            MessageKind::SidePanelReady,
            json!({}),
            ContextTag::Sidepanel,
            None,
            0,
        )
    }

    async fn wait_for_state(spoke: &Spoke, expected: ConnectionState) {
        timeout(Duration::from_secs(2), async {
            while spoke.state() != expected {
                sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("state reached");
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

    #[tokio::test]
    async fn test_setup_twice_schedules_one_attempt() {
        let runtime = MemoryRuntime::new();
        let _listener = runtime.listen().await.expect("listen");
        let spoke = Spoke::new(ContextTag::Sidepanel, shared(&runtime));

        assert_eq!(spoke.state(), ConnectionState::Uninitialized);
        spoke.setup();
        spoke.setup();

        wait_for_state(&spoke, ConnectionState::Connected).await;
        sleep(Duration::from_millis(30)).await;
        assert_eq!(runtime.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_retries_after_backoff() {
        let runtime = MemoryRuntime::new();
        let _listener = runtime.listen().await.expect("listen");
        runtime.fail_next_connects(2);

        let spoke = Spoke::new(ContextTag::Content, shared(&runtime));
        spoke.setup();

        wait_for_state(&spoke, ConnectionState::Connected).await;
        assert_eq!(runtime.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_queue_until_connected() {
        let runtime = MemoryRuntime::new();
        let spoke = Spoke::new(ContextTag::Sidepanel, shared(&runtime));

        let first = envelope();
        let second = envelope();
        spoke.publish(first.clone());
        spoke.publish(second.clone());
        assert_eq!(spoke.queued(), 2);

        let _listener = runtime.listen().await.expect("listen");
        spoke.setup();
        wait_for_state(&spoke, ConnectionState::Connected).await;

        assert_eq!(spoke.queued(), 0);
        assert_eq!(runtime.delivered(), vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn test_send_failure_schedules_reconnect() {
        let runtime = MemoryRuntime::new();
        let _listener = runtime.listen().await.expect("listen");
        let shared = shared(&runtime);
        let stats = Arc::clone(&shared.stats);
        let spoke = Spoke::new(ContextTag::Content, shared);
        spoke.setup();
        wait_for_state(&spoke, ConnectionState::Connected).await;

        runtime.limit_posts(0);
        spoke.publish(envelope());
        runtime.clear_post_limit();

        wait_for_state(&spoke, ConnectionState::Connected).await;
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.send_failures, 1);
        assert_eq!(snapshot.reconnects_scheduled, 1);
        assert_eq!(runtime.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_partial_flush_reconnects_and_keeps_order() {
        let runtime = MemoryRuntime::new();
        let _listener = runtime.listen().await.expect("listen");
        let shared = shared(&runtime);
        let stats = Arc::clone(&shared.stats);
        let spoke = Spoke::new(ContextTag::Sidepanel, shared);

        let queued: Vec<_> = (0..3).map(|_| envelope()).collect();
        for envelope in &queued {
            spoke.publish(envelope.clone());
        }

        // Only the first queued post goes through.
        runtime.limit_posts(1);
        spoke.setup();
        wait_until(|| stats.snapshot().reconnects_scheduled >= 1).await;

        assert_eq!(runtime.delivered(), vec![queued[0].id.clone()]);
        assert_eq!(spoke.queued(), 2);

        let later = envelope();
        spoke.publish(later.clone());
        assert_eq!(spoke.queued(), 3);

        runtime.clear_post_limit();
        wait_until(|| runtime.delivered().len() == 4).await;
        wait_for_state(&spoke, ConnectionState::Connected).await;

        let mut expected: Vec<_> = queued.iter().map(|e| e.id.clone()).collect();
        expected.push(later.id);
        assert_eq!(runtime.delivered(), expected);
        assert_eq!(spoke.queued(), 0);
        assert!(runtime.connect_attempts() >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_attempt() {
        let runtime = MemoryRuntime::new();
        let shared = shared(&runtime);
        let stats = Arc::clone(&shared.stats);
        let spoke = Spoke::new(ContextTag::Content, shared);
        spoke.setup();
        spoke.publish(envelope());
        spoke.shutdown();

        sleep(Duration::from_millis(30)).await;
        assert_eq!(runtime.connect_attempts(), 0);
        assert_eq!(spoke.queued(), 0);
        assert_eq!(spoke.state(), ConnectionState::Disconnected);
        assert_eq!(stats.snapshot().reconnects_scheduled, 0);
    }

    #[tokio::test]
    async fn test_invalidation_counts_discarded_queue() {
        let runtime = MemoryRuntime::new();
        let shared = shared(&runtime);
        let stats = Arc::clone(&shared.stats);
        let spoke = Spoke::new(ContextTag::Content, shared);

        for _ in 0..3 {
            spoke.publish(envelope());
        }
        runtime.invalidate();
        spoke.setup();

        wait_for_state(&spoke, ConnectionState::Invalidated).await;
        assert_eq!(spoke.queued(), 0);
        assert_eq!(stats.snapshot().dropped, 3);
    }
}
