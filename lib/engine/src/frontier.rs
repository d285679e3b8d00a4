//! Node readiness and input merging.
//!
//! Readiness is recomputed over the whole graph from the completed outputs
//! of a run, which keeps it a pure function of persisted state:
//!
//! - An edge out of a completed node is *taken* if the node made no branch
//!   selection or the edge's port was selected; otherwise it is *dead*
//! - Edges out of a dead node are dead; edges out of any other node are
//!   *pending*
//! - A node with a pending incoming edge waits; otherwise it is ready if at
//!   least one incoming edge was taken, and dead if none was
//! - Nodes without predecessors that are not entry nodes of the run are dead

use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use tessera_workflow::envelope::JOIN_DATA_TYPE;
use tessera_workflow::{Edge, Envelope, NodeId, WorkflowGraph};

/// The output of a completed node.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// The node's output envelope.
    pub output: Envelope,
    /// Ports selected by the node, for branching node types.
    pub selection: Option<Vec<String>>,
}

impl Completion {
    /// Builds a completion, honouring the branch selection only when the
    /// node type may branch.
    #[must_use]
    pub fn new(output: Envelope, can_branch: bool) -> Self {
        let selection = if can_branch {
            output.branch_selection()
        } else {
            None
        };
        Self { output, selection }
    }
}

/// Readiness of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// The node completed.
    Completed,
    /// The node has a queue item that has not completed.
    Scheduled,
    /// Every predecessor settled and at least one edge was taken.
    Ready,
    /// Some predecessor has not settled yet.
    Waiting,
    /// The node can no longer run in this run.
    Dead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Taken,
    Dead,
    Pending,
}

/// Readiness of every node of a run.
#[derive(Debug, Clone)]
pub struct Frontier {
    states: HashMap<NodeId, NodeState>,
    order: Vec<NodeId>,
}

impl Frontier {
    /// Evaluates readiness for a run.
    ///
    /// `scheduled` holds the nodes that already have a queue item.
    #[must_use]
    pub fn evaluate(
        graph: &WorkflowGraph,
        entry_nodes: &[NodeId],
        completed: &HashMap<NodeId, Completion>,
        scheduled: &HashSet<NodeId>,
    ) -> Self {
        let mut states: HashMap<NodeId, NodeState> = HashMap::new();

        for node_id in graph.topological_order() {
            let state = if completed.contains_key(node_id) {
                NodeState::Completed
            } else if scheduled.contains(node_id) {
                NodeState::Scheduled
            } else if entry_nodes.contains(node_id) {
                NodeState::Ready
            } else {
                let incoming = graph.incoming(node_id);
                if incoming.is_empty() {
                    NodeState::Dead
                } else {
                    let edges: Vec<_> = incoming
                        .iter()
                        .map(|edge| edge_state(edge, &states, completed))
                        .collect();
                    if edges.contains(&EdgeState::Pending) {
                        NodeState::Waiting
                    } else if edges.contains(&EdgeState::Taken) {
                        NodeState::Ready
                    } else {
                        NodeState::Dead
                    }
                }
            };
            states.insert(node_id.clone(), state);
        }

        Self {
            states,
            order: graph.topological_order().to_vec(),
        }
    }

    /// Returns the state of a node.
    #[must_use]
    pub fn state(&self, node_id: &NodeId) -> Option<NodeState> {
        self.states.get(node_id).copied()
    }

    /// Returns the ready nodes in topological order.
    #[must_use]
    pub fn ready(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| self.states.get(*id) == Some(&NodeState::Ready))
            .cloned()
            .collect()
    }

    /// Builds the input envelope of a ready node from its contributors.
    ///
    /// Returns `None` if the node has no taken incoming edge.
    #[must_use]
    pub fn input_for(
        &self,
        graph: &WorkflowGraph,
        node_id: &NodeId,
        completed: &HashMap<NodeId, Completion>,
    ) -> Option<Envelope> {
        let mut contributors: Vec<(&NodeId, &Envelope)> = Vec::new();
        for edge in graph.incoming(node_id) {
            if edge_state(edge, &self.states, completed) != EdgeState::Taken {
                continue;
            }
            if contributors.iter().any(|(id, _)| *id == &edge.source) {
                continue;
            }
            if let Some(completion) = completed.get(&edge.source) {
                contributors.push((&edge.source, &completion.output));
            }
        }
        merge_inputs(&contributors)
    }

    /// Merges the variables of the completed nodes that ended the run.
    ///
    /// A completed node ends the run when none of its taken edges led to
    /// another completed node. Variables are merged in topological order,
    /// later nodes winning.
    #[must_use]
    pub fn final_variables(
        &self,
        graph: &WorkflowGraph,
        completed: &HashMap<NodeId, Completion>,
    ) -> Map<String, JsonValue> {
        let mut variables = Map::new();
        for node_id in &self.order {
            let Some(completion) = completed.get(node_id) else {
                continue;
            };
            let continued = graph.outgoing(node_id).into_iter().any(|edge| {
                edge_state(edge, &self.states, completed) == EdgeState::Taken
                    && completed.contains_key(&edge.target)
            });
            if !continued {
                for (name, value) in &completion.output.variables {
                    variables.insert(name.clone(), value.clone());
                }
            }
        }
        variables
    }
}

fn edge_state(
    edge: &Edge,
    states: &HashMap<NodeId, NodeState>,
    completed: &HashMap<NodeId, Completion>,
) -> EdgeState {
    match states.get(&edge.source) {
        Some(NodeState::Completed) => {
            let selection = completed
                .get(&edge.source)
                .and_then(|completion| completion.selection.as_deref());
            if edge.is_taken(selection) {
                EdgeState::Taken
            } else {
                EdgeState::Dead
            }
        }
        Some(NodeState::Dead) => EdgeState::Dead,
        _ => EdgeState::Pending,
    }
}

/// Merges the outputs of contributing predecessors into one input envelope.
///
/// Contributors must be given in edge-declaration order. A single
/// contributor passes its data through; several produce an object keyed by
/// contributor id with data type `join`. Variables are merged with the last
/// contributor winning, and the trace is the first contributor's trace
/// followed by unseen entries of the others. The reserved branch field is
/// removed from all data.
#[must_use]
pub fn merge_inputs(contributors: &[(&NodeId, &Envelope)]) -> Option<Envelope> {
    let ((_, first), rest) = contributors.split_first()?;

    if rest.is_empty() {
        let data_type = first.data_type.clone();
        return Some(
            Envelope::new(data_type, first.data_without_branch())
                .with_trace(first.trace.clone())
                .with_variables(first.variables.clone()),
        );
    }

    let mut data = Map::new();
    let mut variables = Map::new();
    let mut trace = first.trace.clone();
    for (index, (node_id, envelope)) in contributors.iter().enumerate() {
        data.insert(node_id.to_string(), envelope.data_without_branch());
        for (name, value) in &envelope.variables {
            variables.insert(name.clone(), value.clone());
        }
        if index > 0 {
            trace = trace.merged_with(&envelope.trace);
        }
    }

    Some(
        Envelope::new(JOIN_DATA_TYPE, JsonValue::Object(data))
            .with_trace(trace)
            .with_variables(variables),
    )
}
