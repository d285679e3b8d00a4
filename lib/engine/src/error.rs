//! Error types for the engine crate.
//!
//! - `StoreError`: failures and guard rejections of store operations
//! - `EngineError`: run creation, transition and cancellation failures
//! - `QueueError`: the leasing protocol as seen by workers

use std::fmt;
use tessera_core::{QueueItemId, RunId, WorkerId, WorkflowId};
use tessera_workflow::RunStatus;

/// Errors from [`Store`](crate::store::Store) operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The worker is not registered.
    UnknownWorker { worker_id: WorkerId },
    /// The item is not leased in the way the caller expected.
    LeaseConflict { item_id: QueueItemId },
    /// The run changed since the caller read it.
    VersionConflict { run_id: RunId, expected: i64 },
    /// The run does not exist.
    RunNotFound { run_id: RunId },
    /// The backing store could not be reached or failed transiently.
    Unavailable { message: String },
    /// Persisted data could not be decoded.
    Corrupt { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownWorker { worker_id } => write!(f, "unknown worker: {worker_id}"),
            Self::LeaseConflict { item_id } => write!(f, "lease conflict on item {item_id}"),
            Self::VersionConflict { run_id, expected } => {
                write!(f, "run {run_id} is no longer at version {expected}")
            }
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::Unavailable { message } => write!(f, "store unavailable: {message}"),
            Self::Corrupt { message } => write!(f, "corrupt store data: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Errors from the execution engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The request was rejected before anything was persisted.
    Validation { message: String },
    /// A run references a workflow that no longer exists.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The run does not exist.
    RunNotFound { run_id: RunId },
    /// The queue item does not exist.
    ItemNotFound { item_id: QueueItemId },
    /// The run already reached a terminal state.
    RunTerminal { run_id: RunId, status: RunStatus },
    /// The caller no longer holds the item's lease.
    LeaseConflict { item_id: QueueItemId },
    /// The run kept changing underneath every replan attempt.
    Contention { run_id: RunId },
    /// Underlying store failure.
    Store(StoreError),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation { message } => write!(f, "validation failed: {message}"),
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::ItemNotFound { item_id } => write!(f, "queue item not found: {item_id}"),
            Self::RunTerminal { run_id, status } => {
                write!(f, "run {run_id} is already {status}")
            }
            Self::LeaseConflict { item_id } => write!(f, "lease conflict on item {item_id}"),
            Self::Contention { run_id } => {
                write!(f, "run {run_id} changed too often to apply the transition")
            }
            Self::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LeaseConflict { item_id } => Self::LeaseConflict { item_id },
            StoreError::RunNotFound { run_id } => Self::RunNotFound { run_id },
            other => Self::Store(other),
        }
    }
}

/// Errors from the work queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The worker is not registered.
    UnknownWorker { worker_id: WorkerId },
    /// The worker does not hold the item's lease.
    LeaseConflict { item_id: QueueItemId },
    /// The request itself is malformed.
    InvalidRequest { message: String },
    /// Engine failure while applying the request.
    Engine(EngineError),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownWorker { worker_id } => write!(f, "unknown worker: {worker_id}"),
            Self::LeaseConflict { item_id } => write!(f, "lease conflict on item {item_id}"),
            Self::InvalidRequest { message } => write!(f, "invalid request: {message}"),
            Self::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<EngineError> for QueueError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::LeaseConflict { item_id } => Self::LeaseConflict { item_id },
            EngineError::Store(StoreError::UnknownWorker { worker_id }) => {
                Self::UnknownWorker { worker_id }
            }
            other => Self::Engine(other),
        }
    }
}

impl From<StoreError> for QueueError {
    fn from(e: StoreError) -> Self {
        EngineError::from(e).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_lease_conflict_surfaces_through_layers() {
        let item_id = QueueItemId::new();
        let err: QueueError = StoreError::LeaseConflict { item_id }.into();
        assert_eq!(err, QueueError::LeaseConflict { item_id });
    }

    #[test]
    fn store_unknown_worker_surfaces_through_layers() {
        let worker_id = WorkerId::new("w1").expect("valid id");
        let err: QueueError = StoreError::UnknownWorker {
            worker_id: worker_id.clone(),
        }
        .into();
        assert_eq!(err, QueueError::UnknownWorker { worker_id });
    }

    #[test]
    fn unavailable_stays_wrapped() {
        let err: QueueError = StoreError::Unavailable {
            message: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(err, QueueError::Engine(EngineError::Store(_))));
        assert!(err.to_string().contains("connection refused"));
    }
}
