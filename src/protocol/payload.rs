//! Typed payloads used by the extension's collaborators.
//!
//! The bus forwards payloads as opaque JSON. These types are a convenience
//! for producers and consumers, used with
//! [`ConnectionManager::send`](crate::ConnectionManager::send) and
//! [`Envelope::payload_as`](super::Envelope::payload_as).

use serde::{Deserialize, Serialize};

// ============================================================================
// Element Selection
// ============================================================================

/// Node of the element tree shown in the side panel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementTreeNode {
    /// Start tag of the element, e.g. `<div class="main">`.
    pub start_tag: String,
    /// Child nodes.
    #[serde(default)]
    pub children: Vec<ElementTreeNode>,
    /// Child indices from the document root.
    pub path: Vec<u32>,
}

/// A picked DOM element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementInfo {
    /// Start tag of the element.
    pub start_tag: String,
    /// Child indices from the document root.
    pub path: Vec<u32>,
    /// Subtree below the element, when the producer collected it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<ElementTreeNode>,
}

/// Payload of `ELEMENT_SELECTED`, `ELEMENT_UNSELECTED` and `SELECT_ELEMENT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectElementPayload {
    /// The element concerned.
    pub element_info: ElementInfo,
}

/// Payload of `TOGGLE_SELECTION_MODE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionModePayload {
    /// Whether picking is being switched on.
    pub enabled: bool,
}

// ============================================================================
// Tabs
// ============================================================================

/// Payload of `TAB_ACTIVATED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabActivatedPayload {
    /// Browser tab id.
    pub tab_id: u32,
    /// Window containing the tab.
    pub window_id: u32,
    /// Tab URL, if the extension may read it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Tab title, if the extension may read it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn test_element_info_camel_case() {
        let payload = SelectElementPayload {
            element_info: ElementInfo {
                start_tag: "<div>".to_string(),
                path: vec![0, 2],
                children: None,
            },
        };

        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(
            value,
            json!({ "elementInfo": { "startTag": "<div>", "path": [0, 2] } })
        );
    }

    #[test]
    fn test_element_tree_defaults_children() {
        let node: ElementTreeNode =
            serde_json::from_value(json!({ "startTag": "<span>", "path": [1] })).expect("parse");
        assert!(node.children.is_empty());
    }

    #[test]
    fn test_tab_activated_optional_fields() {
        let payload: TabActivatedPayload =
            serde_json::from_value(json!({ "tabId": 3, "windowId": 1 })).expect("parse");
        assert_eq!(payload.tab_id, 3);
        assert_eq!(payload.url, None);
    }
}
