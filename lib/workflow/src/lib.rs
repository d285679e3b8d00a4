//! Workflow model and node execution contract for tessera.
//!
//! This crate provides the pieces shared by the engine, the workers and the
//! scheduler:
//!
//! - **Definitions**: workflows as nodes plus edges, validated into a petgraph DAG
//! - **Envelopes**: the immutable value passed between nodes, with its trace
//! - **Node contract**: the [`NodeType`] trait, its metadata and error taxonomy
//! - **Registry**: the explicit set of node types a process can execute
//! - **Platform**: collaborators handed to node types (HTTP client, key/value store)
//! - **Execution records**: runs, steps, queue items and workers
//! - **Triggers**: schedule, webhook, event and manual entry points

pub mod builtin;
pub mod definition;
pub mod edge;
pub mod envelope;
pub mod error;
pub mod execution;
pub mod graph;
pub mod node;
pub mod platform;
pub mod registry;
pub mod retry;
pub mod trigger;

pub use definition::{JoinPolicy, Workflow, WorkflowNode};
pub use edge::Edge;
pub use envelope::{BRANCH_FIELD, Envelope, Trace};
pub use error::{GraphError, PlatformError, RegistryError};
pub use execution::{
    QueueItem, QueueItemStatus, Run, RunContext, RunError, RunStatus, Step, StepStatus, Worker,
    WorkerStatus,
};
pub use graph::WorkflowGraph;
pub use node::{
    ExecutionContext, NodeErrorCode, NodeExecutionError, NodeId, NodeMeta, NodeType,
};
pub use platform::{KeyValueStore, MemoryKeyValueStore, Platform, WorkflowCaller};
pub use registry::NodeRegistry;
pub use retry::{Backoff, RetryPolicy};
pub use trigger::{Trigger, TriggerConfig, TriggerKind};
