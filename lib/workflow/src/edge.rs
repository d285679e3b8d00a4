//! Edges between workflow nodes.

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// A directed edge from `source` to `target`.
///
/// An edge bound to a `port` is only followed when the source node selects
/// that port. An unbound edge is followed whenever the source makes no
/// selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// The upstream node.
    pub source: NodeId,
    /// The downstream node.
    pub target: NodeId,
    /// Output port of the source this edge is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
}

impl Edge {
    /// Creates an unbound edge.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            port: None,
        }
    }

    /// Binds the edge to an output port of its source.
    #[must_use]
    pub fn on_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    /// Returns true if the edge is taken given the source's branch selection.
    #[must_use]
    pub fn is_taken(&self, selection: Option<&[String]>) -> bool {
        match selection {
            None => true,
            Some(ports) => self
                .port
                .as_ref()
                .is_some_and(|port| ports.iter().any(|p| p == port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_edge_taken_without_selection() {
        let edge = Edge::new("a", "b");
        assert!(edge.is_taken(None));
        assert!(!edge.is_taken(Some(&["yes".to_string()])));
    }

    #[test]
    fn port_edge_follows_selection() {
        let edge = Edge::new("a", "b").on_port("yes");
        assert!(edge.is_taken(None));
        assert!(edge.is_taken(Some(&["no".to_string(), "yes".to_string()])));
        assert!(!edge.is_taken(Some(&["no".to_string()])));
        assert!(!edge.is_taken(Some(&[])));
    }

    #[test]
    fn port_omitted_from_json_when_unbound() {
        let json = serde_json::to_value(Edge::new("a", "b")).expect("serialize");
        assert_eq!(json, serde_json::json!({"source": "a", "target": "b"}));

        let parsed: Edge =
            serde_json::from_value(serde_json::json!({"source": "a", "target": "b", "port": "p"}))
                .expect("deserialize");
        assert_eq!(parsed.port.as_deref(), Some("p"));
    }
}
