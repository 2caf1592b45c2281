//! Type-safe identifiers for envelopes, peers and subscriptions.
//!
//! Newtype wrappers keep envelope ids, channel names and subscription
//! handles from being mixed up at compile time.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::ContextTag;

// ============================================================================
// Clock Helper
// ============================================================================

/// Milliseconds since the Unix epoch, saturating to zero on clock skew.
#[inline]
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

// ============================================================================
// EnvelopeId
// ============================================================================

/// Unique identifier of a single envelope.
///
/// Generated locally from a UUID v4. Any string is accepted from the wire
/// since other peers may use a different id scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeId(String);

impl EnvelopeId {
    /// Generates a fresh random id.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EnvelopeId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// PeerName
// ============================================================================

/// Last suffix handed out by [`PeerName::generate`].
static LAST_PEER_SUFFIX: AtomicU64 = AtomicU64::new(0);

/// Name of one transport channel, `<context>-<timestamp>`.
///
/// The hub keys its peer table by this name. The timestamp suffix keeps
/// repeated script injections apart; within one process it is forced to be
/// strictly increasing so two names minted in the same millisecond differ.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerName(String);

impl PeerName {
    /// Mints a new channel name for the given context.
    #[must_use]
    pub fn generate(context: ContextTag) -> Self {
        let now = unix_millis();
        let previous = LAST_PEER_SUFFIX
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        let suffix = now.max(previous + 1);

        Self(format!("{context}-{suffix}"))
    }

    /// Wraps an existing name received from a peer.
    #[inline]
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the context tag encoded in the name prefix, if any.
    #[must_use]
    pub fn context(&self) -> Option<ContextTag> {
        let (prefix, _) = self.0.rsplit_once('-')?;
        ContextTag::from_str(prefix).ok()
    }

    /// Returns the name as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// SubscriptionId
// ============================================================================

/// Counter backing [`SubscriptionId::next`].
static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registered handler.
///
/// Ids are never reused within a process, so disposing a stale handle can
/// never remove somebody else's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Returns the next process-unique id.
    #[inline]
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
