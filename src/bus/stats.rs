//! Delivery counters.
//!
//! Publishing never reports failures to its caller, so these counters are
//! the only place lost or delayed envelopes become visible.

use std::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// BusStats
// ============================================================================

/// Live counters shared by every role of one manager.
#[derive(Debug, Default)]
pub struct BusStats {
    published: AtomicU64,
    sent: AtomicU64,
    queued: AtomicU64,
    dropped: AtomicU64,
    send_failures: AtomicU64,
    received: AtomicU64,
    connect_attempts: AtomicU64,
    reconnects_scheduled: AtomicU64,
}

/// Point-in-time copy of [`BusStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Envelopes created by `send_message`.
    pub published: u64,
    /// Successful posts, including flushed and rebroadcast envelopes.
    pub sent: u64,
    /// Envelopes parked in the outbound queue.
    pub queued: u64,
    /// Envelopes discarded by the queue bound or an invalidated context.
    pub dropped: u64,
    /// Posts the transport rejected.
    pub send_failures: u64,
    /// Envelopes received from the transport.
    pub received: u64,
    /// Connection attempts made by a spoke.
    pub connect_attempts: u64,
    /// Reconnections scheduled after a failure or disconnect.
    pub reconnects_scheduled: u64,
}

impl BusStats {
    #[inline]
    pub(crate) fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_queued(&self) {
        self.queued.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_dropped(&self) {
        self.record_dropped_n(1);
    }

    #[inline]
    pub(crate) fn record_dropped_n(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            reconnects_scheduled: self.reconnects_scheduled.load(Ordering::Relaxed),
        }
    }
}
