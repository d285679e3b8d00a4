//! Message types of the worker protocol.
//!
//! The same types travel in-process through [`crate::EmbeddedCoordinator`]
//! and as JSON bodies over HTTP.

use crate::engine::ItemOutcome;
use serde::{Deserialize, Serialize};
use tessera_core::{QueueItemId, WorkerId};

/// Sent by a worker when it starts, and again if the coordinator forgot it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRegistration {
    /// Worker id, unique among live workers.
    pub id: WorkerId,
    /// Human-readable name.
    pub name: String,
    /// Items the worker executes at once; at least one.
    pub concurrency: u32,
}

/// Body of a claim request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    /// Upper bound on the items returned.
    pub max_items: u32,
}

/// Body of a heartbeat response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    /// Items held by the worker whose runs were cancelled; stop executing them.
    #[serde(default)]
    pub cancelled: Vec<QueueItemId>,
}

/// Body of a completion report.
pub type CompleteWorkRequest = ItemOutcome;

/// JSON error body returned by the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// The error.
    pub error: ErrorDetail,
}

/// Machine-readable code and human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code, e.g. `lease_conflict`.
    pub code: String,
    /// Description of the failure.
    pub message: String,
}

impl ErrorBody {
    /// Creates an error body.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}
