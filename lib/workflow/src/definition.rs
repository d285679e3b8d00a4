//! Workflow definition types.
//!
//! Definitions are owned by an external collaborator and are read-only here.
//! A workflow is a list of typed nodes plus the edges between them; the
//! order of `edges` is significant, it decides how join inputs are merged.

use crate::edge::Edge;
use crate::error::GraphError;
use crate::graph::WorkflowGraph;
use crate::node::NodeId;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tessera_core::WorkflowId;

/// How a node with several predecessors decides it is ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Wait until every predecessor has either completed or been ruled out.
    #[default]
    WaitForAll,
}

/// A node inside a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Id, unique within the workflow.
    pub id: NodeId,
    /// Registered node type name.
    pub node_type: String,
    /// Type-specific configuration.
    #[serde(default)]
    pub config: JsonValue,
    /// Overrides the engine's default retry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Overrides the worker's default per-attempt timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Readiness rule for joins.
    #[serde(default)]
    pub join: JoinPolicy,
}

impl WorkflowNode {
    /// Creates a node with an empty config.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: JsonValue::Object(serde_json::Map::new()),
            retry: None,
            timeout_ms: None,
            join: JoinPolicy::default(),
        }
    }

    /// Sets the config.
    #[must_use]
    pub fn with_config(mut self, config: JsonValue) -> Self {
        self.config = config;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// Human-readable name.
    pub name: String,
    /// Nodes, in declaration order.
    pub nodes: Vec<WorkflowNode>,
    /// Edges, in declaration order.
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl Workflow {
    /// Creates an empty workflow.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(WorkflowId::new(), name)
    }

    /// Creates an empty workflow with a specific id.
    #[must_use]
    pub fn with_id(id: WorkflowId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Appends a node.
    #[must_use]
    pub fn node(mut self, node: WorkflowNode) -> Self {
        self.nodes.push(node);
        self
    }

    /// Appends an edge.
    #[must_use]
    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn find_node(&self, node_id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| &n.id == node_id)
    }

    /// Builds and validates the execution graph.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] if the definition is empty, has duplicate
    /// node ids, references unknown nodes or contains a cycle.
    pub fn graph(&self) -> Result<WorkflowGraph, GraphError> {
        WorkflowGraph::from_workflow(self)
    }
}
