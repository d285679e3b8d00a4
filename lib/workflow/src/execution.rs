//! Execution records: runs, steps, queue items and workers.
//!
//! These are plain data. State transitions are decided by the engine and
//! applied atomically by a store; the helpers here only encode the rules
//! both sides need to agree on.

use crate::envelope::Envelope;
use crate::node::{NodeErrorCode, NodeExecutionError, NodeId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::str::FromStr;
use tessera_core::{QueueItemId, RunId, StepId, TriggerId, WorkerId, WorkflowId};

/// Implements `as_str`, `Display` and `FromStr` for a status enum stored as
/// snake_case text.
macro_rules! status_strings {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the storage representation.
            #[must_use]
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }
    };
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, no item claimed yet.
    Pending,
    /// At least one item has been claimed.
    Running,
    /// Every reachable node completed.
    Completed,
    /// A node exhausted its retry budget.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

status_strings!(RunStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true if a run may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running | Self::Cancelled) => true,
            (Self::Pending | Self::Running, Self::Completed | Self::Failed) => true,
            (Self::Running, Self::Cancelled) => true,
            _ => false,
        }
    }
}

/// Initial payload and variables of a run.
///
/// When a run completes, `variables` is replaced by the merged variables of
/// the nodes that finished it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    /// The payload the run was started with.
    #[serde(default)]
    pub payload: JsonValue,
    /// Run variables.
    #[serde(default)]
    pub variables: Map<String, JsonValue>,
}

/// The failure surfaced on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    /// The node whose failure ended the run.
    pub node_id: NodeId,
    /// The node's type.
    pub node_type: String,
    /// The node's error message.
    pub message: String,
    /// The node's error code.
    pub code: NodeErrorCode,
    /// The attempt that failed last.
    pub attempt: u32,
}

impl RunError {
    /// Builds the run error from the final attempt's node error.
    #[must_use]
    pub fn from_node_error(error: &NodeExecutionError, attempt: u32) -> Self {
        Self {
            node_id: error.node_id.clone(),
            node_type: error.node_type.clone(),
            message: error.message.clone(),
            code: error.code,
            attempt,
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    /// Unique identifier.
    pub id: RunId,
    /// The workflow being executed.
    pub workflow_id: WorkflowId,
    /// The trigger that started the run, if any.
    pub trigger_id: Option<TriggerId>,
    /// Current status.
    pub status: RunStatus,
    /// Payload and variables.
    pub context: RunContext,
    /// Nodes the run was started at.
    pub entry_nodes: Vec<NodeId>,
    /// Failure details once Failed.
    pub error: Option<RunError>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the first item was claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency counter, bumped by every engine transition.
    pub version: i64,
}

impl Run {
    /// Creates a pending run.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        trigger_id: Option<TriggerId>,
        context: RunContext,
        entry_nodes: Vec<NodeId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RunId::new(),
            workflow_id,
            trigger_id,
            status: RunStatus::Pending,
            context,
            entry_nodes,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }

    /// Returns true if the run is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Status of a step row.
///
/// Only terminal attempts are persisted; `Pending` and `Running` exist for
/// API consumers that present in-flight work as steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Waiting for a worker.
    Pending,
    /// Being executed.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

status_strings!(StepStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

/// Immutable record of one execution attempt of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Unique identifier.
    pub id: StepId,
    /// The run this attempt belongs to.
    pub run_id: RunId,
    /// The node attempted.
    pub node_id: NodeId,
    /// Outcome.
    pub status: StepStatus,
    /// Input envelope.
    pub input: Envelope,
    /// Output envelope, when completed.
    pub output: Option<Envelope>,
    /// Error, when failed.
    pub error: Option<NodeExecutionError>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt was claimed.
    pub started_at: DateTime<Utc>,
    /// When the attempt finished.
    pub completed_at: DateTime<Utc>,
}

impl Step {
    /// Records a successful attempt of `item`.
    #[must_use]
    pub fn completed(item: &QueueItem, output: Envelope, now: DateTime<Utc>) -> Self {
        Self::record(item, StepStatus::Completed, Some(output), None, now)
    }

    /// Records a failed attempt of `item`.
    #[must_use]
    pub fn failed(item: &QueueItem, error: NodeExecutionError, now: DateTime<Utc>) -> Self {
        Self::record(item, StepStatus::Failed, None, Some(error), now)
    }

    fn record(
        item: &QueueItem,
        status: StepStatus,
        output: Option<Envelope>,
        error: Option<NodeExecutionError>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: StepId::new(),
            run_id: item.run_id,
            node_id: item.node_id.clone(),
            status,
            input: item.payload.clone(),
            output,
            error,
            attempt: item.attempt,
            started_at: item.claimed_at.unwrap_or(now),
            completed_at: now,
        }
    }
}

/// Status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting to be claimed.
    Pending,
    /// Leased by a worker.
    Claimed,
    /// Finished successfully.
    Completed,
    /// Finished with its retry budget exhausted.
    Failed,
    /// Its run was cancelled or failed elsewhere.
    Cancelled,
}

status_strings!(QueueItemStatus {
    Pending => "pending",
    Claimed => "claimed",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl QueueItemStatus {
    /// Returns true while the item still represents work to do.
    #[must_use]
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed)
    }
}

/// A durable unit of work: execute one node of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique identifier.
    pub id: QueueItemId,
    /// The run the item belongs to.
    pub run_id: RunId,
    /// The run's workflow.
    pub workflow_id: WorkflowId,
    /// The node to execute.
    pub node_id: NodeId,
    /// The node's type name.
    pub node_type: String,
    /// The node's configuration.
    pub config: JsonValue,
    /// Current status.
    pub status: QueueItemStatus,
    /// Worker holding the lease.
    pub lease_owner: Option<WorkerId>,
    /// When the current lease lapses.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Per-attempt timeout override.
    pub timeout_ms: Option<u64>,
    /// Input envelope.
    pub payload: Envelope,
    /// When the item was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time the item may be claimed.
    pub available_at: DateTime<Utc>,
    /// When the current lease was taken.
    pub claimed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    /// Returns true if the item is claimed and its lease has lapsed at `now`.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueItemStatus::Claimed
            && self.lease_expires_at.is_some_and(|expires| expires <= now)
    }

    /// Returns true if `worker` currently holds the lease.
    #[must_use]
    pub fn is_leased_by(&self, worker: &WorkerId) -> bool {
        self.status == QueueItemStatus::Claimed && self.lease_owner.as_ref() == Some(worker)
    }

    /// Returns true if the item can be claimed at `now`.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueItemStatus::Pending && self.available_at <= now
    }

    /// Marks the item claimed by `worker` for `lease`.
    pub fn claim(&mut self, worker: &WorkerId, lease: Duration, now: DateTime<Utc>) {
        self.status = QueueItemStatus::Claimed;
        self.lease_owner = Some(worker.clone());
        self.lease_expires_at = Some(now + lease);
        self.claimed_at = Some(now);
    }

    /// Returns the item to the queue for another attempt.
    pub fn requeue(&mut self, attempt: u32, available_at: DateTime<Utc>) {
        self.status = QueueItemStatus::Pending;
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.claimed_at = None;
        self.attempt = attempt;
        self.available_at = available_at;
    }
}

/// Derived liveness of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Heartbeat seen recently.
    Active,
    /// No heartbeat within the staleness window.
    Stale,
}

/// A registered worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Identifier chosen by the worker.
    pub id: WorkerId,
    /// Human-readable name.
    pub name: String,
    /// Maximum number of items the worker executes at once.
    pub concurrency: u32,
    /// Last heartbeat or registration.
    pub last_heartbeat: DateTime<Utc>,
    /// First registration.
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    /// Creates a freshly registered worker.
    #[must_use]
    pub fn new(id: WorkerId, name: impl Into<String>, concurrency: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: name.into(),
            concurrency,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    /// Returns the worker's status at `now` given a staleness window.
    #[must_use]
    pub fn status_at(&self, now: DateTime<Utc>, stale_after: Duration) -> WorkerStatus {
        if now - self.last_heartbeat > stale_after {
            WorkerStatus::Stale
        } else {
            WorkerStatus::Active
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(now: DateTime<Utc>) -> QueueItem {
        QueueItem {
            id: QueueItemId::new(),
            run_id: RunId::new(),
            workflow_id: WorkflowId::new(),
            node_id: NodeId::from("a"),
            node_type: "passthrough".to_string(),
            config: json!({}),
            status: QueueItemStatus::Pending,
            lease_owner: None,
            lease_expires_at: None,
            attempt: 1,
            max_attempts: 3,
            timeout_ms: None,
            payload: Envelope::new("test", json!({})),
            enqueued_at: now,
            available_at: now,
            claimed_at: None,
        }
    }

    #[test]
    fn run_status_transitions() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            QueueItemStatus::Pending,
            QueueItemStatus::Claimed,
            QueueItemStatus::Completed,
            QueueItemStatus::Failed,
            QueueItemStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<QueueItemStatus>(), Ok(status));
        }
        assert_eq!("running".parse::<RunStatus>(), Ok(RunStatus::Running));
        assert!("bogus".parse::<StepStatus>().is_err());
    }

    #[test]
    fn claim_and_lease_expiry() {
        let now = Utc::now();
        let worker = WorkerId::new("w1").expect("valid id");
        let mut item = item(now);

        assert!(item.is_claimable(now));
        item.claim(&worker, Duration::seconds(30), now);

        assert!(item.is_leased_by(&worker));
        assert!(!item.is_claimable(now));
        assert!(!item.lease_expired(now + Duration::seconds(29)));
        assert!(item.lease_expired(now + Duration::seconds(30)));
    }

    #[test]
    fn requeue_clears_lease() {
        let now = Utc::now();
        let worker = WorkerId::new("w1").expect("valid id");
        let mut item = item(now);
        item.claim(&worker, Duration::seconds(30), now);

        item.requeue(2, now + Duration::seconds(5));

        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempt, 2);
        assert!(item.lease_owner.is_none());
        assert!(!item.is_claimable(now));
        assert!(item.is_claimable(now + Duration::seconds(5)));
    }

    #[test]
    fn step_records_attempt() {
        let now = Utc::now();
        let worker = WorkerId::new("w1").expect("valid id");
        let mut item = item(now);
        item.claim(&worker, Duration::seconds(30), now);

        let output = item.payload.derive(&item.node_id);
        let step = Step::completed(&item, output.clone(), now + Duration::seconds(1));

        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.attempt, 1);
        assert_eq!(step.started_at, now);
        assert_eq!(step.output, Some(output));
        assert_eq!(step.input, item.payload);
    }

    #[test]
    fn worker_staleness() {
        let now = Utc::now();
        let worker = Worker::new(WorkerId::new("w1").expect("valid id"), "w1", 4, now);
        let window = Duration::seconds(30);

        assert_eq!(worker.status_at(now + Duration::seconds(10), window), WorkerStatus::Active);
        assert_eq!(worker.status_at(now + Duration::seconds(31), window), WorkerStatus::Stale);
    }

    #[test]
    fn queue_item_json_is_camel_case() {
        let json = serde_json::to_value(item(Utc::now())).expect("serialize");
        assert!(json.get("runId").is_some());
        assert!(json.get("maxAttempts").is_some());
        assert_eq!(json["status"], "pending");
    }
}
