//! Bus configuration.
//!
//! Timing and queue limits for a [`ConnectionManager`](crate::ConnectionManager).
//! Values can be set in code or loaded from the extension's settings store,
//! which persists them as JSON with millisecond durations:
//!
//! ```json
//! {
//!   "initialConnectDelayMs": 100,
//!   "reconnectDelayMs": 1000,
//!   "queueCapacity": 1024,
//!   "overflow": "dropOldest"
//! }
//! ```
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use extension_bus::BusConfig;
//!
//! let config = BusConfig::new()
//!     .with_reconnect_delay(Duration::from_millis(250))
//!     .with_queue_capacity(64);
//!
//! assert!(config.validate().is_ok());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Delay before the first connection attempt of a spoke.
pub const DEFAULT_INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(100);

/// Delay between a failure and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Outbound queue bound.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// ============================================================================
// OverflowPolicy
// ============================================================================

/// What a full outbound queue does with a new envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Evict the oldest queued envelope to make room.
    #[default]
    DropOldest,
    /// Discard the new envelope.
    DropNewest,
}

// ============================================================================
// BusConfig
// ============================================================================

/// Connection and queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// Delay before a spoke's first connection attempt.
    #[serde(rename = "initialConnectDelayMs", with = "millis")]
    pub initial_connect_delay: Duration,

    /// Fixed backoff between reconnection attempts.
    #[serde(rename = "reconnectDelayMs", with = "millis")]
    pub reconnect_delay: Duration,

    /// Maximum queued envelopes while disconnected; `None` is unbounded.
    pub queue_capacity: Option<usize>,

    /// Eviction policy once `queue_capacity` is reached.
    pub overflow: OverflowPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl BusConfig {
    /// Creates a configuration with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_connect_delay: DEFAULT_INITIAL_CONNECT_DELAY,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
            overflow: OverflowPolicy::DropOldest,
        }
    }

    /// Parses settings JSON; missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// - [`Error::Json`] if the document is malformed
    /// - [`Error::Config`] if the values fail [`validate`](Self::validate)
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads settings JSON from a file.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the file cannot be read
    /// - otherwise as [`from_json`](Self::from_json)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl BusConfig {
    /// Sets the delay before the first connection attempt.
    #[inline]
    #[must_use]
    pub fn with_initial_connect_delay(mut self, delay: Duration) -> Self {
        self.initial_connect_delay = delay;
        self
    }

    /// Sets the reconnection backoff.
    #[inline]
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Bounds the outbound queue.
    #[inline]
    #[must_use]
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Removes the outbound queue bound.
    #[inline]
    #[must_use]
    pub fn with_unbounded_queue(mut self) -> Self {
        self.queue_capacity = None;
        self
    }

    /// Sets the overflow policy.
    #[inline]
    #[must_use]
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}

// ============================================================================
// Validation
// ============================================================================

impl BusConfig {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if either delay or the queue capacity is
    /// zero.
    pub fn validate(&self) -> Result<()> {
        if self.initial_connect_delay.is_zero() {
            return Err(Error::config(
                "initial connect delay must be greater than zero",
            ));
        }

        if self.reconnect_delay.is_zero() {
            return Err(Error::config(
                "reconnect delay must be greater than zero",
            ));
        }

        if self.queue_capacity == Some(0) {
            return Err(Error::config(
                "queue capacity must be greater than zero (omit it for an unbounded queue)",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Serde Helpers
// ============================================================================

/// Durations as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        duration: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.initial_connect_delay, Duration::from_millis(100));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.queue_capacity, Some(DEFAULT_QUEUE_CAPACITY));
        assert_eq!(config.overflow, OverflowPolicy::DropOldest);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = BusConfig::new()
            .with_initial_connect_delay(Duration::from_millis(5))
            .with_reconnect_delay(Duration::from_millis(20))
            .with_unbounded_queue()
            .with_overflow(OverflowPolicy::DropNewest);

        assert_eq!(config.initial_connect_delay, Duration::from_millis(5));
        assert_eq!(config.queue_capacity, None);
        assert_eq!(config.overflow, OverflowPolicy::DropNewest);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let config = BusConfig::new().with_reconnect_delay(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        let config = BusConfig::new().with_initial_connect_delay(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config { .. })));

        let config = BusConfig::new().with_queue_capacity(0);
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_from_json_partial() {
        let config = BusConfig::from_json(r#"{"reconnectDelayMs": 250, "overflow": "dropNewest"}"#)
            .expect("valid settings");

        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.initial_connect_delay, DEFAULT_INITIAL_CONNECT_DELAY);
        assert_eq!(config.overflow, OverflowPolicy::DropNewest);
    }

    #[test]
    fn test_from_json_null_capacity_is_unbounded() {
        let config = BusConfig::from_json(r#"{"queueCapacity": null}"#).expect("valid settings");
        assert_eq!(config.queue_capacity, None);
    }

    #[test]
    fn test_from_json_invalid() {
        assert!(matches!(
            BusConfig::from_json(r#"{"reconnectDelayMs": 0}"#),
            Err(Error::Config { .. })
        ));
        assert!(matches!(
            BusConfig::from_json(r#"{"initialConnectDelayMs": 0}"#),
            Err(Error::Config { .. })
        ));
        assert!(matches!(BusConfig::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"initialConnectDelayMs": 10, "queueCapacity": 8}}"#).expect("write");

        let config = BusConfig::from_file(file.path()).expect("load settings");
        assert_eq!(config.initial_connect_delay, Duration::from_millis(10));
        assert_eq!(config.queue_capacity, Some(8));
    }

    #[test]
    fn test_from_missing_file() {
        let result = BusConfig::from_file("/nonexistent/extension-bus/settings.json");
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn test_json_roundtrip_uses_millis() {
        let json = serde_json::to_value(BusConfig::default()).expect("serialize");
        assert_eq!(json["reconnectDelayMs"], 1000);
        assert_eq!(json["initialConnectDelayMs"], 100);
    }
}
