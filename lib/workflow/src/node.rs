//! The node execution contract.
//!
//! A node type is a trait object registered by name in a
//! [`NodeRegistry`](crate::registry::NodeRegistry). Workers look up the type
//! of each queue item, build an [`ExecutionContext`] and call
//! [`NodeType::execute_envelope`].

use crate::envelope::Envelope;
use crate::platform::Platform;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use tessera_core::{RunId, WorkflowId};
use tokio_util::sync::CancellationToken;

/// Identifier of a node within a workflow definition.
///
/// Node ids are chosen by the workflow author and are only unique within
/// their workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Static description of a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Name the type is registered under.
    pub type_name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema describing the node's config.
    pub parameters: JsonValue,
    /// Whether the node may select output ports through `_branch`.
    pub can_branch: bool,
}

impl NodeMeta {
    /// Creates metadata for a non-branching node with an unconstrained config.
    #[must_use]
    pub fn new(type_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            description: description.into(),
            parameters: serde_json::json!({"type": "object"}),
            can_branch: false,
        }
    }

    /// Sets the parameter schema.
    #[must_use]
    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    /// Marks the node as able to branch.
    #[must_use]
    pub fn branching(mut self) -> Self {
        self.can_branch = true;
        self
    }
}

/// Machine-readable classification of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorCode {
    /// The node ran and failed.
    ExecutionFailed,
    /// The input envelope or config was not acceptable.
    InvalidInput,
    /// The node returned an envelope that breaks the contract.
    InvalidOutput,
    /// The node, or the lease it ran under, timed out.
    Timeout,
    /// Execution was cancelled.
    Cancelled,
    /// No node type with the item's type name is registered.
    UnsupportedNodeType,
    /// The node type could not be initialized.
    InitializationFailed,
}

impl NodeErrorCode {
    /// Returns the wire and storage representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExecutionFailed => "execution_failed",
            Self::InvalidInput => "invalid_input",
            Self::InvalidOutput => "invalid_output",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::UnsupportedNodeType => "unsupported_node_type",
            Self::InitializationFailed => "initialization_failed",
        }
    }
}

impl fmt::Display for NodeErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "execution_failed" => Ok(Self::ExecutionFailed),
            "invalid_input" => Ok(Self::InvalidInput),
            "invalid_output" => Ok(Self::InvalidOutput),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            "unsupported_node_type" => Ok(Self::UnsupportedNodeType),
            "initialization_failed" => Ok(Self::InitializationFailed),
            other => Err(format!("unknown node error code: {other}")),
        }
    }
}

/// Error returned by a node execution attempt.
///
/// The message is kept verbatim; it is what workflow authors see on the
/// failed step and run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeExecutionError {
    /// The node that failed.
    pub node_id: NodeId,
    /// The type of the node that failed.
    pub node_type: String,
    /// Human-readable description.
    pub message: String,
    /// Classification.
    pub code: NodeErrorCode,
}

impl NodeExecutionError {
    /// Creates an error.
    #[must_use]
    pub fn new(
        node_id: NodeId,
        node_type: impl Into<String>,
        code: NodeErrorCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            node_id,
            node_type: node_type.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for NodeExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "node {} ({}) failed with {}: {}",
            self.node_id, self.node_type, self.code, self.message
        )
    }
}

impl std::error::Error for NodeExecutionError {}

/// Everything a node sees about the attempt it is executing.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// The run the node belongs to.
    pub run_id: RunId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// The node being executed.
    pub node_id: NodeId,
    /// The node's type name.
    pub node_type: String,
    /// 1-based attempt number.
    pub attempt: u32,
    platform: Platform,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        run_id: RunId,
        workflow_id: WorkflowId,
        node_id: NodeId,
        node_type: impl Into<String>,
        attempt: u32,
        platform: Platform,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            run_id,
            workflow_id,
            node_id,
            node_type: node_type.into(),
            attempt,
            platform,
            cancellation,
        }
    }

    /// Returns the platform collaborators.
    #[must_use]
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Returns the cancellation token for this attempt.
    ///
    /// Long-running nodes should select on
    /// [`CancellationToken::cancelled`] and stop early.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns true once the attempt has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Builds an error attributed to this node.
    #[must_use]
    pub fn error(&self, code: NodeErrorCode, message: impl Into<String>) -> NodeExecutionError {
        NodeExecutionError::new(self.node_id.clone(), self.node_type.clone(), code, message)
    }
}

/// A kind of node that can be executed by workers.
#[async_trait]
pub trait NodeType: Send + Sync {
    /// Returns the node type's metadata.
    fn meta(&self) -> NodeMeta;

    /// Prepares the node type before any execution.
    ///
    /// Called once per process when the registry is initialized. Failing here
    /// stops the process from accepting work.
    ///
    /// # Errors
    ///
    /// Returns a description of what is missing or misconfigured.
    async fn initialize(&self, _platform: &Platform) -> Result<(), String> {
        Ok(())
    }

    /// Executes one attempt of the node.
    ///
    /// Implementations should build their output with
    /// [`Envelope::derive`] so that the trace records the node.
    ///
    /// # Errors
    ///
    /// Returns a [`NodeExecutionError`] describing the failure. The engine
    /// applies the node's retry policy to it.
    async fn execute_envelope(
        &self,
        ctx: &ExecutionContext,
        config: &JsonValue,
        input: &Envelope,
    ) -> Result<Envelope, NodeExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_string_roundtrip() {
        for code in [
            NodeErrorCode::ExecutionFailed,
            NodeErrorCode::InvalidInput,
            NodeErrorCode::InvalidOutput,
            NodeErrorCode::Timeout,
            NodeErrorCode::Cancelled,
            NodeErrorCode::UnsupportedNodeType,
            NodeErrorCode::InitializationFailed,
        ] {
            assert_eq!(code.as_str().parse::<NodeErrorCode>(), Ok(code));
            assert_eq!(
                serde_json::to_value(code).expect("serialize"),
                serde_json::json!(code.as_str())
            );
        }
        assert!("nope".parse::<NodeErrorCode>().is_err());
    }

    #[test]
    fn long_messages_are_kept_whole() {
        let message = "x".repeat(10_000);
        let err = NodeExecutionError::new(
            NodeId::from("a"),
            "http",
            NodeErrorCode::ExecutionFailed,
            message.clone(),
        );
        assert_eq!(err.message.len(), 10_000);
        assert!(err.to_string().ends_with(&message));
    }

    #[test]
    fn context_error_is_attributed_to_node() {
        let ctx = ExecutionContext::new(
            RunId::new(),
            WorkflowId::new(),
            NodeId::from("fetch"),
            "http",
            2,
            Platform::new(),
            CancellationToken::new(),
        );
        let err = ctx.error(NodeErrorCode::InvalidInput, "missing url");

        assert_eq!(err.node_id, NodeId::from("fetch"));
        assert_eq!(err.node_type, "http");
        assert_eq!(err.code, NodeErrorCode::InvalidInput);
    }

    #[test]
    fn context_reports_cancellation() {
        let token = CancellationToken::new();
        let ctx = ExecutionContext::new(
            RunId::new(),
            WorkflowId::new(),
            NodeId::from("a"),
            "passthrough",
            1,
            Platform::new(),
            token.clone(),
        );
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }
}
