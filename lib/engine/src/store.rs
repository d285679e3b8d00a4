//! The persistence boundary of the engine.
//!
//! Every change to runs, steps, queue items and workers goes through one of
//! the [`Store`] operations below, and each of them is atomic. Multiple
//! engine processes may share one store; nothing here relies on in-process
//! locking.

use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tessera_core::{QueueItemId, RunId, WorkerId, WorkflowId};
use tessera_workflow::{QueueItem, Run, RunContext, RunError, RunStatus, Step, Worker, Workflow};

/// Everything the engine needs to plan a transition of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    /// The run, including its current version.
    pub run: Run,
    /// Every queue item of the run, whatever its status.
    pub items: Vec<QueueItem>,
    /// Step rows of the run in insertion order.
    pub steps: Vec<Step>,
}

impl RunSnapshot {
    /// Returns the item with the given id.
    #[must_use]
    pub fn item(&self, item_id: QueueItemId) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == item_id)
    }
}

/// Condition an item must satisfy for a transition to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemGuard {
    /// The item is Claimed by this worker.
    Owner(WorkerId),
    /// The item is Claimed and its lease lapsed at or before `now`.
    LeaseExpired { now: DateTime<Utc> },
}

impl ItemGuard {
    /// Returns true if `item` satisfies the guard.
    #[must_use]
    pub fn admits(&self, item: &QueueItem) -> bool {
        match self {
            Self::Owner(worker) => item.is_leased_by(worker),
            Self::LeaseExpired { now } => item.lease_expired(*now),
        }
    }
}

/// What happens to the guarded item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemChange {
    /// The attempt succeeded.
    Complete,
    /// The attempt failed and the budget is exhausted.
    Fail,
    /// The item goes back to the queue.
    Retry {
        /// The next attempt number.
        attempt: u32,
        /// Earliest time the next attempt may be claimed.
        available_at: DateTime<Utc>,
    },
}

/// A guarded change to one queue item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    /// The item to change.
    pub item_id: QueueItemId,
    /// Condition checked under the transition's lock.
    pub guard: ItemGuard,
    /// The change.
    pub change: ItemChange,
}

/// A status change of the run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    /// The new status.
    pub status: RunStatus,
    /// Failure details, for Failed.
    pub error: Option<RunError>,
    /// Replacement context, for Completed.
    pub context: Option<RunContext>,
    /// When the change happened.
    pub at: DateTime<Utc>,
}

/// One atomic engine transition of a run.
///
/// Applied only if the run is still at `expected_version` and the item guard
/// holds; the run version is then bumped by one.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTransition {
    /// The run being changed.
    pub run_id: RunId,
    /// The version the plan was computed against.
    pub expected_version: i64,
    /// The queue item whose outcome is being applied.
    pub item: Option<ItemUpdate>,
    /// Step row to append.
    pub step: Option<Step>,
    /// New queue items; an item for a node that already has one is skipped.
    pub enqueue: Vec<QueueItem>,
    /// Run status change.
    pub run_update: Option<RunUpdate>,
    /// Cancel every other Pending or Claimed item of the run.
    pub cancel_outstanding: bool,
}

impl RunTransition {
    /// Creates an empty transition against `expected_version`.
    #[must_use]
    pub fn new(run_id: RunId, expected_version: i64) -> Self {
        Self {
            run_id,
            expected_version,
            item: None,
            step: None,
            enqueue: Vec::new(),
            run_update: None,
            cancel_outstanding: false,
        }
    }
}

/// Result of inserting a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunInsert {
    /// The run and its items were persisted.
    Created,
    /// A run with the same dedupe key already exists.
    Duplicate(RunId),
}

/// Durable storage for workflows, runs, steps, queue items and workers.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Reads a workflow definition.
    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>, StoreError>;

    /// Persists a run and its initial items atomically.
    ///
    /// With a `dedupe_key`, at most one run is ever created per key.
    async fn insert_run(
        &self,
        run: &Run,
        items: &[QueueItem],
        dedupe_key: Option<&str>,
    ) -> Result<RunInsert, StoreError>;

    /// Reads a run.
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError>;

    /// Reads a run together with its items and steps.
    ///
    /// The run is read first; any later change to the items or steps bumps
    /// its version, so a plan built from a torn read is rejected on apply.
    async fn load_snapshot(&self, run_id: RunId) -> Result<Option<RunSnapshot>, StoreError>;

    /// Lists the step rows of a run in insertion order.
    async fn list_steps(&self, run_id: RunId) -> Result<Vec<Step>, StoreError>;

    /// Reads a queue item.
    async fn get_item(&self, item_id: QueueItemId) -> Result<Option<QueueItem>, StoreError>;

    /// Applies a transition atomically.
    ///
    /// # Errors
    ///
    /// [`StoreError::LeaseConflict`] if the item guard fails,
    /// [`StoreError::VersionConflict`] if the run moved on,
    /// [`StoreError::RunNotFound`] if the run is missing.
    async fn apply_transition(&self, transition: &RunTransition) -> Result<(), StoreError>;

    /// Leases up to `limit` claimable items to `worker_id`, oldest first.
    ///
    /// Runs of claimed items move from Pending to Running, which bumps their
    /// version.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownWorker`] if the worker is not registered.
    async fn claim_items(
        &self,
        worker_id: &WorkerId,
        limit: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Records a heartbeat and extends every lease the worker holds.
    ///
    /// Returns the items leased by the worker that were cancelled since its
    /// last heartbeat; they are reported once.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownWorker`] if the worker is not registered.
    async fn extend_leases(
        &self,
        worker_id: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>, StoreError>;

    /// Lists up to `limit` Claimed items whose lease lapsed at or before `now`.
    async fn expired_items(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueItem>, StoreError>;

    /// Lists the Claimed items leased by a worker.
    async fn items_leased_by(&self, worker_id: &WorkerId) -> Result<Vec<QueueItem>, StoreError>;

    /// Registers or refreshes a worker, keeping its original registration time.
    async fn upsert_worker(&self, worker: &Worker) -> Result<Worker, StoreError>;

    /// Reads a worker.
    async fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<Worker>, StoreError>;

    /// Deletes a worker. Returns false if it did not exist.
    async fn delete_worker(&self, worker_id: &WorkerId) -> Result<bool, StoreError>;
}
