//! Error types for the workflow crate.
//!
//! - `GraphError`: structural problems in a workflow definition
//! - `RegistryError`: node type registration and initialization failures
//! - `PlatformError`: failures of collaborators exposed to node types

use crate::node::NodeId;
use std::fmt;

/// Errors from building or validating a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The workflow has no nodes.
    Empty,
    /// Two nodes share the same id.
    DuplicateNode { node_id: NodeId },
    /// An edge references a node that does not exist.
    NodeNotFound { node_id: NodeId },
    /// The graph contains a cycle.
    CycleDetected,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "workflow has no nodes"),
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::NodeNotFound { node_id } => {
                write!(f, "edge references unknown node: {node_id}")
            }
            Self::CycleDetected => write!(f, "graph contains cycles"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from the node registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// A node type with this name is already registered.
    AlreadyRegistered { type_name: String },
    /// A node type failed to initialize.
    InitializationFailed { type_name: String, message: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRegistered { type_name } => {
                write!(f, "node type already registered: {type_name}")
            }
            Self::InitializationFailed { type_name, message } => {
                write!(f, "node type {type_name} failed to initialize: {message}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Errors from platform collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The capability is not available in this process.
    Unavailable { capability: String },
    /// The collaborator failed.
    Failed { message: String },
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { capability } => write!(f, "{capability} not available"),
            Self::Failed { message } => write!(f, "platform call failed: {message}"),
        }
    }
}

impl std::error::Error for PlatformError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_error_display() {
        let err = GraphError::NodeNotFound {
            node_id: NodeId::from("missing"),
        };
        assert_eq!(err.to_string(), "edge references unknown node: missing");
        assert_eq!(GraphError::CycleDetected.to_string(), "graph contains cycles");
    }

    #[test]
    fn registry_error_display() {
        let err = RegistryError::InitializationFailed {
            type_name: "http".to_string(),
            message: "no proxy configured".to_string(),
        };
        assert!(err.to_string().contains("http"));
        assert!(err.to_string().contains("no proxy configured"));
    }
}
