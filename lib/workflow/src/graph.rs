//! Workflow graph implementation using petgraph.
//!
//! The graph is derived from a [`Workflow`] definition. Node weights are the
//! author-chosen [`NodeId`]s and edge weights are the position of the edge in
//! the definition, so that incoming edges can always be visited in
//! declaration order regardless of how petgraph stores adjacency.

use crate::definition::Workflow;
use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::NodeId;
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

/// A validated, acyclic workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    graph: DiGraph<NodeId, usize>,
    edges: Vec<Edge>,
    node_index_map: HashMap<NodeId, NodeIndex>,
    topological: Vec<NodeId>,
}

impl WorkflowGraph {
    /// Builds the graph for a workflow definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is empty, declares a node twice,
    /// has an edge to or from an unknown node, or contains a cycle.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self, GraphError> {
        if workflow.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut graph = DiGraph::new();
        let mut node_index_map = HashMap::new();

        for node in &workflow.nodes {
            if node_index_map.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
            let index = graph.add_node(node.id.clone());
            node_index_map.insert(node.id.clone(), index);
        }

        for (position, edge) in workflow.edges.iter().enumerate() {
            let source = node_index_map
                .get(&edge.source)
                .ok_or_else(|| GraphError::NodeNotFound {
                    node_id: edge.source.clone(),
                })?;
            let target = node_index_map
                .get(&edge.target)
                .ok_or_else(|| GraphError::NodeNotFound {
                    node_id: edge.target.clone(),
                })?;
            graph.add_edge(*source, *target, position);
        }

        let order = toposort(&graph, None).map_err(|_| GraphError::CycleDetected)?;
        let topological = order
            .into_iter()
            .filter_map(|index| graph.node_weight(index).cloned())
            .collect();

        Ok(Self {
            graph,
            edges: workflow.edges.clone(),
            node_index_map,
            topological,
        })
    }

    /// Returns true if the graph contains `node_id`.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_index_map.contains_key(node_id)
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns all node ids in a topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[NodeId] {
        &self.topological
    }

    /// Returns nodes without incoming edges, in declaration order.
    #[must_use]
    pub fn entry_nodes(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Incoming)
    }

    /// Returns nodes without outgoing edges, in declaration order.
    #[must_use]
    pub fn sink_nodes(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Outgoing)
    }

    /// Returns the edges into `node_id`, in declaration order.
    #[must_use]
    pub fn incoming(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edges_in(node_id, Direction::Incoming)
    }

    /// Returns the edges out of `node_id`, in declaration order.
    #[must_use]
    pub fn outgoing(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edges_in(node_id, Direction::Outgoing)
    }

    fn nodes_without(&self, direction: Direction) -> Vec<NodeId> {
        // node_indices follow insertion order, which is declaration order
        self.graph
            .node_indices()
            .filter(|&idx| self.graph.edges_directed(idx, direction).next().is_none())
            .filter_map(|idx| self.graph.node_weight(idx).cloned())
            .collect()
    }

    fn edges_in(&self, node_id: &NodeId, direction: Direction) -> Vec<&Edge> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };

        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(index, direction)
            .map(|edge| *edge.weight())
            .collect();
        positions.sort_unstable();
        positions
            .into_iter()
            .filter_map(|position| self.edges.get(position))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WorkflowNode;

    fn diamond() -> Workflow {
        Workflow::new("diamond")
            .node(WorkflowNode::new("start", "passthrough"))
            .node(WorkflowNode::new("left", "passthrough"))
            .node(WorkflowNode::new("right", "passthrough"))
            .node(WorkflowNode::new("join", "passthrough"))
            .edge(Edge::new("start", "left"))
            .edge(Edge::new("start", "right"))
            .edge(Edge::new("right", "join"))
            .edge(Edge::new("left", "join"))
    }

    #[test]
    fn entry_and_sink_nodes() {
        let graph = diamond().graph().expect("valid graph");
        assert_eq!(graph.entry_nodes(), vec![NodeId::from("start")]);
        assert_eq!(graph.sink_nodes(), vec![NodeId::from("join")]);
        assert_eq!(graph.node_count(), 4);
    }

    #[test]
    fn incoming_edges_follow_declaration_order() {
        let graph = diamond().graph().expect("valid graph");
        let sources: Vec<_> = graph
            .incoming(&NodeId::from("join"))
            .into_iter()
            .map(|e| e.source.as_str())
            .collect();
        assert_eq!(sources, ["right", "left"]);
    }

    #[test]
    fn topological_order_puts_sources_first() {
        let graph = diamond().graph().expect("valid graph");
        let order = graph.topological_order();
        let position = |id: &str| {
            order
                .iter()
                .position(|n| n.as_str() == id)
                .expect("node in order")
        };
        assert!(position("start") < position("left"));
        assert!(position("left") < position("join"));
        assert!(position("right") < position("join"));
    }

    #[test]
    fn rejects_cycles() {
        let workflow = Workflow::new("cycle")
            .node(WorkflowNode::new("a", "passthrough"))
            .node(WorkflowNode::new("b", "passthrough"))
            .edge(Edge::new("a", "b"))
            .edge(Edge::new("b", "a"));
        assert_eq!(workflow.graph().unwrap_err(), GraphError::CycleDetected);
    }

    #[test]
    fn rejects_unknown_nodes_and_duplicates() {
        let dangling = Workflow::new("dangling")
            .node(WorkflowNode::new("a", "passthrough"))
            .edge(Edge::new("a", "ghost"));
        assert_eq!(
            dangling.graph().unwrap_err(),
            GraphError::NodeNotFound {
                node_id: NodeId::from("ghost")
            }
        );

        let duplicate = Workflow::new("duplicate")
            .node(WorkflowNode::new("a", "passthrough"))
            .node(WorkflowNode::new("a", "passthrough"));
        assert!(matches!(
            duplicate.graph(),
            Err(GraphError::DuplicateNode { .. })
        ));

        assert_eq!(Workflow::new("empty").graph().unwrap_err(), GraphError::Empty);
    }
}
