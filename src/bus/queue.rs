//! Outbound queue of a disconnected spoke.
//!
//! Envelopes published while no channel exists wait here and are flushed in
//! FIFO order once a channel opens. A failed post during the flush puts the
//! envelope back at the front and stops, so order is never changed by a
//! partial failure.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use crate::config::{BusConfig, OverflowPolicy};
use crate::error::Error;
use crate::protocol::Envelope;
use crate::transport::Port;

// ============================================================================
// Flush
// ============================================================================

/// Outcome of one flush.
#[derive(Debug)]
pub struct Flush {
    /// Envelopes posted successfully.
    pub sent: usize,
    /// Envelopes still queued.
    pub remaining: usize,
    /// The post failure that stopped the flush, if any.
    pub failure: Option<Error>,
}

// ============================================================================
// OutboundQueue
// ============================================================================

/// FIFO queue with an optional bound.
#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<Envelope>,
    capacity: Option<usize>,
    overflow: OverflowPolicy,
}

impl OutboundQueue {
    /// Creates a queue with the given bound.
    #[must_use]
    pub fn new(capacity: Option<usize>, overflow: OverflowPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            overflow,
        }
    }

    /// Creates a queue from a bus configuration.
    #[must_use]
    pub fn from_config(config: &BusConfig) -> Self {
        Self::new(config.queue_capacity, config.overflow)
    }

    /// Appends an envelope.
    ///
    /// Returns the envelope evicted by the overflow policy, if the queue was
    /// full.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let full = self
            .capacity
            .is_some_and(|capacity| self.entries.len() >= capacity);

        if !full {
            self.entries.push_back(envelope);
            return None;
        }

        match self.overflow {
            OverflowPolicy::DropOldest => {
                let evicted = self.entries.pop_front();
                self.entries.push_back(envelope);
                evicted
            }
            OverflowPolicy::DropNewest => Some(envelope),
        }
    }

    /// Posts queued envelopes in order until the queue is empty or a post
    /// fails.
    pub fn flush(&mut self, port: &dyn Port) -> Flush {
        let mut sent = 0;

        while let Some(envelope) = self.entries.pop_front() {
            if let Err(e) = port.post_message(&envelope) {
                self.entries.push_front(envelope);
                return Flush {
                    sent,
                    remaining: self.entries.len(),
                    failure: Some(e),
                };
            }
            sent += 1;
        }

        Flush {
            sent,
            remaining: 0,
            failure: None,
        }
    }

    /// Removes and returns the front envelope.
    pub fn pop_front(&mut self) -> Option<Envelope> {
        self.entries.pop_front()
    }

    /// Removes every queued envelope, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Number of queued envelopes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is queued.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates queued envelopes front to back.
    pub fn iter(&self) -> impl Iterator<Item = &Envelope> {
        self.entries.iter()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use parking_lot::Mutex;
    use proptest::prelude::*;
    use serde_json::json;

    use crate::error::Result;
    use crate::identifiers::{EnvelopeId, PeerName};
    use crate::protocol::{ContextTag, MessageKind};

    /// Port that accepts `budget` posts and then fails.
    struct FlakyPort {
        name: PeerName,
        budget: Mutex<Option<usize>>,
        posted: Mutex<Vec<EnvelopeId>>,
    }

    impl FlakyPort {
        fn new(budget: Option<usize>) -> Self {
            Self {
                name: PeerName::new("content-1"),
                budget: Mutex::new(budget),
                posted: Mutex::new(Vec::new()),
            }
        }
    }

    impl Port for FlakyPort {
        fn name(&self) -> &PeerName {
            &self.name
        }

        fn post_message(&self, envelope: &Envelope) -> Result<()> {
            let mut budget = self.budget.lock();
            match budget.as_mut() {
                Some(0) => return Err(Error::ConnectionClosed),
                Some(remaining) => *remaining -= 1,
                None => {}
            }
            self.posted.lock().push(envelope.id.clone());
            Ok(())
        }

        fn disconnect(&self) {}
    }

    fn envelope(n: usize) -> Envelope {
        Envelope::new(
            MessageKind::ElementSelected,
            json!({ "n": n }),
            ContextTag::Content,
            None,
            n as u64,
        )
    }

    fn ids(queue: &OutboundQueue) -> Vec<EnvelopeId> {
        queue.iter().map(|envelope| envelope.id.clone()).collect()
    }

    #[test]
    fn test_flush_in_publish_order() {
        let mut queue = OutboundQueue::new(None, OverflowPolicy::DropOldest);
        let published: Vec<_> = (0..5).map(envelope).collect();
        for envelope in &published {
            assert!(queue.push(envelope.clone()).is_none());
        }

        let port = FlakyPort::new(None);
        let flush = queue.flush(&port);

        assert_eq!(flush.sent, 5);
        assert_eq!(flush.remaining, 0);
        assert!(flush.failure.is_none());
        assert_eq!(
            *port.posted.lock(),
            published.iter().map(|e| e.id.clone()).collect::<Vec<_>>()
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_partial_flush_keeps_failed_envelope_in_front() {
        let mut queue = OutboundQueue::new(None, OverflowPolicy::DropOldest);
        let published: Vec<_> = (0..6).map(envelope).collect();
        for envelope in &published {
            queue.push(envelope.clone());
        }

        // Third post fails.
        let flaky = FlakyPort::new(Some(2));
        let flush = queue.flush(&flaky);

        assert_eq!(flush.sent, 2);
        assert_eq!(flush.remaining, 4);
        assert!(matches!(flush.failure, Some(Error::ConnectionClosed)));
        assert_eq!(ids(&queue), published[2..].iter().map(|e| e.id.clone()).collect::<Vec<_>>());

        let healthy = FlakyPort::new(None);
        let flush = queue.flush(&healthy);
        assert_eq!(flush.sent, 4);
        assert_eq!(
            *healthy.posted.lock(),
            published[2..].iter().map(|e| e.id.clone()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_drop_oldest_overflow() {
        let mut queue = OutboundQueue::new(Some(2), OverflowPolicy::DropOldest);
        let first = envelope(1);
        queue.push(first.clone());
        queue.push(envelope(2));

        let evicted = queue.push(envelope(3)).expect("evicted");
        assert_eq!(evicted.id, first.id);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_drop_newest_overflow() {
        let mut queue = OutboundQueue::new(Some(1), OverflowPolicy::DropNewest);
        let kept = envelope(1);
        queue.push(kept.clone());

        let rejected = envelope(2);
        let evicted = queue.push(rejected.clone()).expect("evicted");
        assert_eq!(evicted.id, rejected.id);
        assert_eq!(ids(&queue), vec![kept.id]);
    }

    #[test]
    fn test_pop_front_skips_head() {
        let mut queue = OutboundQueue::new(None, OverflowPolicy::DropOldest);
        let head = envelope(1);
        let next = envelope(2);
        queue.push(head.clone());
        queue.push(next.clone());

        assert_eq!(queue.pop_front().map(|e| e.id), Some(head.id));
        assert_eq!(ids(&queue), vec![next.id]);
    }

    #[test]
    fn test_clear() {
        let mut queue = OutboundQueue::from_config(&BusConfig::default());
        queue.push(envelope(1));
        queue.push(envelope(2));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_flush_failure_preserves_order(count in 1usize..40, budget in 0usize..40) {
            let mut queue = OutboundQueue::new(None, OverflowPolicy::DropOldest);
            let published: Vec<_> = (0..count).map(envelope).collect();
            for envelope in &published {
                queue.push(envelope.clone());
            }

            let port = FlakyPort::new(Some(budget));
            let flush = queue.flush(&port);
            let sent = budget.min(count);

            prop_assert_eq!(flush.sent, sent);
            prop_assert_eq!(flush.failure.is_some(), budget < count);

            let expected_sent: Vec<_> = published[..sent].iter().map(|e| e.id.clone()).collect();
            let expected_left: Vec<_> = published[sent..].iter().map(|e| e.id.clone()).collect();
            prop_assert_eq!(port.posted.lock().clone(), expected_sent);
            prop_assert_eq!(ids(&queue), expected_left);
        }

        #[test]
        fn prop_bounded_queue_keeps_newest(count in 0usize..60, capacity in 1usize..20) {
            let mut queue = OutboundQueue::new(Some(capacity), OverflowPolicy::DropOldest);
            let published: Vec<_> = (0..count).map(envelope).collect();
            for envelope in &published {
                queue.push(envelope.clone());
            }

            let start = count.saturating_sub(capacity);
            let expected: Vec<_> = published[start..].iter().map(|e| e.id.clone()).collect();
            prop_assert_eq!(ids(&queue), expected);
        }
    }
}
