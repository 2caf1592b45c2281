//! Wire types exchanged between extension contexts.
//!
//! # Protocol Overview
//!
//! Every message is one JSON [`Envelope`]. The bus routes on the declared
//! [`MessageKind`] and the optional target [`ContextTag`]; payloads are
//! opaque.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `envelope` | Envelope and timestamp clock |
//! | `kind` | Context tags and message kinds |
//! | `payload` | Typed payloads of the built-in kinds |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope type and per-sender clock.
pub mod envelope;

/// Context tags and message kinds.
pub mod kind;

/// Typed payloads for built-in kinds.
pub mod payload;

// ============================================================================
// Re-exports
// ============================================================================

pub use envelope::{Envelope, EnvelopeClock};
pub use kind::{ContextTag, MessageKind};
pub use payload::{
    ElementInfo, ElementTreeNode, SelectElementPayload, SelectionModePayload, TabActivatedPayload,
};
