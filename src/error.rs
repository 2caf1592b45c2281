//! Error types for the extension message bus.
//!
//! Nothing in this module ever reaches the caller of
//! [`ConnectionManager::send_message`](crate::ConnectionManager::send_message):
//! publishing is fire-and-forget and transport failures are logged and
//! counted instead. These errors surface from the transport seam
//! ([`HostRuntime`](crate::transport::HostRuntime), [`Port`](crate::transport::Port)),
//! configuration loading, and typed payload decoding.
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::ContextInvalidated`] |
//! | Protocol | [`Error::Protocol`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when a [`BusConfig`](crate::BusConfig) fails validation or
    /// cannot be loaded.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Opening or using a channel failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// The channel was already closed when a message was posted.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The host runtime reports that this context is gone for good.
    ///
    /// A spoke that sees this stops reconnecting permanently.
    #[error("Extension context invalidated")]
    ContextInvalidated,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Malformed frame or handshake.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::ContextInvalidated
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the host invalidated this context.
    #[inline]
    #[must_use]
    pub fn is_invalidated(&self) -> bool {
        matches!(self, Self::ContextInvalidated)
    }

    /// Returns `true` if this error is recoverable.
    ///
    /// Recoverable errors may succeed on a later connection attempt.
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionClosed | Self::WebSocket(_) | Self::Io(_)
        )
    }
}

// ============================================================================
// Tests
// ============================================================================
