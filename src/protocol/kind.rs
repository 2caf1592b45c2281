//! Context tags and message kinds.
//!
//! # Message Kinds
//!
//! | Group | Kinds |
//! |-------|-------|
//! | Lifecycle | `SIDE_PANEL_READY`, `SIDE_PANEL_CLOSED`, `CONTENT_READY`, `TAB_ACTIVATED` |
//! | Selection | `TOGGLE_SELECTION_MODE`, `SELECT_ELEMENT`, `ELEMENT_SELECTED`, `ELEMENT_UNSELECTED`, `CLEAR_SELECTION` |
//! | Capture | `CAPTURE_TAB`, `CAPTURE_TAB_RESULT` |
//! | Observability | `DEBUG` (wildcard) |
//!
//! Any other name decodes as [`MessageKind::Custom`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

// ============================================================================
// ContextTag
// ============================================================================

/// One of the isolated execution contexts of the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextTag {
    /// Script injected into a web page.
    Content,
    /// Long-lived background process; runs the hub.
    Background,
    /// Extension UI panel.
    Sidepanel,
}

impl ContextTag {
    /// Returns the wire name.
    #[inline]
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Background => "background",
            Self::Sidepanel => "sidepanel",
        }
    }

    /// Returns `true` for the context that runs the hub role.
    #[inline]
    #[must_use]
    pub const fn is_hub(&self) -> bool {
        matches!(self, Self::Background)
    }
}

impl fmt::Display for ContextTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content" => Ok(Self::Content),
            "background" => Ok(Self::Background),
            "sidepanel" => Ok(Self::Sidepanel),
            other => Err(Error::protocol(format!("Unknown context tag: {other}"))),
        }
    }
}

// ============================================================================
// MessageKind
// ============================================================================

/// Declared type of an envelope.
///
/// The bus never interprets payloads; the kind only selects subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    /// Side panel finished loading.
    SidePanelReady,
    /// Side panel was closed.
    SidePanelClosed,
    /// Content script finished loading.
    ContentReady,
    /// Browser switched the active tab.
    TabActivated,
    /// Turn element picking on or off.
    ToggleSelectionMode,
    /// A page element was picked.
    ElementSelected,
    /// The picked element was released.
    ElementUnselected,
    /// Select the element at a given path.
    SelectElement,
    /// Drop the current selection.
    ClearSelection,
    /// Request a capture of the active tab.
    CaptureTab,
    /// Result of a tab capture.
    CaptureTabResult,
    /// Wildcard: subscribers receive every envelope.
    Debug,
    /// Kind defined by a collaborator.
    Custom(String),
}

impl MessageKind {
    /// Returns the wire name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::SidePanelReady => "SIDE_PANEL_READY",
            Self::SidePanelClosed => "SIDE_PANEL_CLOSED",
            Self::ContentReady => "CONTENT_READY",
            Self::TabActivated => "TAB_ACTIVATED",
            Self::ToggleSelectionMode => "TOGGLE_SELECTION_MODE",
            Self::ElementSelected => "ELEMENT_SELECTED",
            Self::ElementUnselected => "ELEMENT_UNSELECTED",
            Self::SelectElement => "SELECT_ELEMENT",
            Self::ClearSelection => "CLEAR_SELECTION",
            Self::CaptureTab => "CAPTURE_TAB",
            Self::CaptureTabResult => "CAPTURE_TAB_RESULT",
            Self::Debug => "DEBUG",
            Self::Custom(name) => name,
        }
    }

    /// Returns `true` for the wildcard kind.
    #[inline]
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Debug)
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "SIDE_PANEL_READY" => Self::SidePanelReady,
            "SIDE_PANEL_CLOSED" => Self::SidePanelClosed,
            "CONTENT_READY" => Self::ContentReady,
            "TAB_ACTIVATED" => Self::TabActivated,
            "TOGGLE_SELECTION_MODE" => Self::ToggleSelectionMode,
            "ELEMENT_SELECTED" => Self::ElementSelected,
            "ELEMENT_UNSELECTED" => Self::ElementUnselected,
            "SELECT_ELEMENT" => Self::SelectElement,
            "CLEAR_SELECTION" => Self::ClearSelection,
            "CAPTURE_TAB" => Self::CaptureTab,
            "CAPTURE_TAB_RESULT" => Self::CaptureTabResult,
            "DEBUG" => Self::Debug,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Tests
// ============================================================================
