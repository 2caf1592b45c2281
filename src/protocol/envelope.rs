//! The envelope exchanged between contexts.
//!
//! # Format
//!
//! ```json
//! {
//!   "id": "0f8fad5b-d9cb-469f-a165-70867728950e",
//!   "type": "ELEMENT_SELECTED",
//!   "payload": { "elementInfo": { "startTag": "<div>", "path": [0, 2] } },
//!   "source": "content",
//!   "target": "sidepanel",
//!   "timestamp": 1729350000000
//! }
//! ```
//!
//! `target` is omitted for broadcasts.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::identifiers::{EnvelopeId, unix_millis};

use super::{ContextTag, MessageKind};

// ============================================================================
// Envelope
// ============================================================================

/// One serialized message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique id, assigned at creation.
    pub id: EnvelopeId,

    /// Declared kind, selects subscribers.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Opaque payload.
    #[serde(default)]
    pub payload: Value,

    /// Context that created the envelope.
    pub source: ContextTag,

    /// Intended receiver; `None` broadcasts to every endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ContextTag>,

    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Envelope {
    /// Creates an envelope with a fresh id.
    #[must_use]
    pub fn new(
        kind: MessageKind,
        payload: Value,
        source: ContextTag,
        target: Option<ContextTag>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: EnvelopeId::generate(),
            kind,
            payload,
            source,
            target,
            timestamp,
        }
    }

    /// Returns `true` if the envelope has no explicit target.
    #[inline]
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.target.is_none()
    }

    /// Returns `true` if a context with `tag` should receive this envelope.
    #[inline]
    #[must_use]
    pub fn is_addressed_to(&self, tag: Option<ContextTag>) -> bool {
        match self.target {
            None => true,
            Some(target) => tag == Some(target),
        }
    }

    /// Decodes the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) if the payload does not
    /// match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.payload)?)
    }
}

// ============================================================================
// EnvelopeClock
// ============================================================================

/// Per-sender timestamp source.
///
/// Wall-clock milliseconds, clamped so the sequence never goes backwards
/// even if the system clock does.
#[derive(Debug, Default)]
pub struct EnvelopeClock {
    last: AtomicU64,
}

impl EnvelopeClock {
    /// Creates a clock starting at zero.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            last: AtomicU64::new(0),
        }
    }

    /// Returns the next timestamp, never less than the previous one.
    pub fn now_ms(&self) -> u64 {
        self.stamp(unix_millis())
    }

    fn stamp(&self, now: u64) -> u64 {
        let previous = self.last.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}

// ============================================================================
// Tests
// ============================================================================
