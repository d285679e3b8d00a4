//! In-memory [`Store`] for single-process use and tests.
//!
//! All state sits behind one async mutex, so every operation is trivially
//! atomic. Nothing survives a restart.

use crate::error::StoreError;
use crate::store::{ItemChange, RunInsert, RunSnapshot, RunTransition, Store};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tessera_core::{QueueItemId, RunId, WorkerId, WorkflowId};
use tessera_workflow::{QueueItem, QueueItemStatus, Run, RunStatus, Step, Worker, Workflow};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    workflows: HashMap<WorkflowId, Workflow>,
    runs: HashMap<RunId, Run>,
    steps: Vec<Step>,
    items: HashMap<QueueItemId, QueueItem>,
    workers: HashMap<WorkerId, Worker>,
    dedupe: HashMap<String, RunId>,
}

impl State {
    fn has_item_for(&self, item: &QueueItem) -> bool {
        self.items
            .values()
            .any(|existing| existing.run_id == item.run_id && existing.node_id == item.node_id)
    }

    fn run_items(&self, run_id: RunId) -> Vec<QueueItem> {
        let mut items: Vec<_> = self
            .items
            .values()
            .filter(|item| item.run_id == run_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| (a.enqueued_at, a.id).cmp(&(b.enqueued_at, b.id)));
        items
    }
}

/// A [`Store`] kept entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a workflow definition.
    pub async fn put_workflow(&self, workflow: Workflow) {
        self.state
            .lock()
            .await
            .workflows
            .insert(workflow.id, workflow);
    }

    /// Lists the queue items of a run, oldest first.
    pub async fn run_items(&self, run_id: RunId) -> Vec<QueueItem> {
        self.state.lock().await.run_items(run_id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(self.state.lock().await.workflows.get(&workflow_id).cloned())
    }

    async fn insert_run(
        &self,
        run: &Run,
        items: &[QueueItem],
        dedupe_key: Option<&str>,
    ) -> Result<RunInsert, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(key) = dedupe_key {
            if let Some(existing) = state.dedupe.get(key) {
                return Ok(RunInsert::Duplicate(*existing));
            }
            state.dedupe.insert(key.to_string(), run.id);
        }

        state.runs.insert(run.id, run.clone());
        for item in items {
            if !state.has_item_for(item) {
                state.items.insert(item.id, item.clone());
            }
        }
        Ok(RunInsert::Created)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn load_snapshot(&self, run_id: RunId) -> Result<Option<RunSnapshot>, StoreError> {
        let state = self.state.lock().await;
        let Some(run) = state.runs.get(&run_id).cloned() else {
            return Ok(None);
        };
        Ok(Some(RunSnapshot {
            run,
            items: state.run_items(run_id),
            steps: state
                .steps
                .iter()
                .filter(|step| step.run_id == run_id)
                .cloned()
                .collect(),
        }))
    }

    async fn list_steps(&self, run_id: RunId) -> Result<Vec<Step>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .steps
            .iter()
            .filter(|step| step.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn get_item(&self, item_id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        Ok(self.state.lock().await.items.get(&item_id).cloned())
    }

    async fn apply_transition(&self, transition: &RunTransition) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let run_id = transition.run_id;

        // check every guard before touching anything
        let Some(run) = state.runs.get(&run_id) else {
            return Err(StoreError::RunNotFound { run_id });
        };
        let current_version = run.version;
        if let Some(update) = &transition.item {
            let admitted = state
                .items
                .get(&update.item_id)
                .is_some_and(|item| item.run_id == run_id && update.guard.admits(item));
            if !admitted {
                return Err(StoreError::LeaseConflict {
                    item_id: update.item_id,
                });
            }
        }
        if current_version != transition.expected_version {
            return Err(StoreError::VersionConflict {
                run_id,
                expected: transition.expected_version,
            });
        }

        let skip_item = transition.item.as_ref().map(|update| update.item_id);
        let claimed_at = skip_item
            .and_then(|item_id| state.items.get(&item_id))
            .and_then(|item| item.claimed_at);
        if let Some(update) = &transition.item {
            if let Some(item) = state.items.get_mut(&update.item_id) {
                match update.change {
                    ItemChange::Complete => {
                        item.status = QueueItemStatus::Completed;
                        item.lease_expires_at = None;
                    }
                    ItemChange::Fail => {
                        item.status = QueueItemStatus::Failed;
                        item.lease_expires_at = None;
                    }
                    ItemChange::Retry {
                        attempt,
                        available_at,
                    } => item.requeue(attempt, available_at),
                }
            }
        }

        if let Some(step) = &transition.step {
            state.steps.push(step.clone());
        }

        for item in &transition.enqueue {
            if !state.has_item_for(item) {
                state.items.insert(item.id, item.clone());
            }
        }

        if transition.cancel_outstanding {
            for item in state.items.values_mut() {
                if item.run_id == run_id
                    && Some(item.id) != skip_item
                    && item.status.is_outstanding()
                {
                    // lease owner kept so the worker hears about it on heartbeat
                    item.status = QueueItemStatus::Cancelled;
                    item.lease_expires_at = None;
                }
            }
        }

        if let Some(run) = state.runs.get_mut(&run_id) {
            // a reported item proves the run started, even if the claim
            // never got to mark it
            if let Some(claimed_at) = claimed_at {
                run.started_at.get_or_insert(claimed_at);
                if run.status == RunStatus::Pending {
                    run.status = RunStatus::Running;
                }
            }
            if let Some(update) = &transition.run_update {
                run.status = update.status;
                if update.status.is_terminal() {
                    run.completed_at = Some(update.at);
                }
                if let Some(error) = &update.error {
                    run.error = Some(error.clone());
                }
                if let Some(context) = &update.context {
                    run.context = context.clone();
                }
            }
            run.version += 1;
        }

        Ok(())
    }

    async fn claim_items(
        &self,
        worker_id: &WorkerId,
        limit: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let mut state = self.state.lock().await;
        if !state.workers.contains_key(worker_id) {
            return Err(StoreError::UnknownWorker {
                worker_id: worker_id.clone(),
            });
        }

        let mut claimable: Vec<_> = state
            .items
            .values()
            .filter(|item| item.is_claimable(now))
            .map(|item| (item.enqueued_at, item.id))
            .collect();
        claimable.sort();
        claimable.truncate(usize::try_from(limit).unwrap_or(usize::MAX));

        let mut claimed = Vec::with_capacity(claimable.len());
        for (_, item_id) in claimable {
            let Some(item) = state.items.get_mut(&item_id) else {
                continue;
            };
            item.claim(worker_id, lease, now);
            let item = item.clone();

            if let Some(run) = state.runs.get_mut(&item.run_id) {
                if run.status == RunStatus::Pending {
                    run.status = RunStatus::Running;
                    run.started_at.get_or_insert(now);
                    run.version += 1;
                }
            }
            claimed.push(item);
        }
        Ok(claimed)
    }

    async fn extend_leases(
        &self,
        worker_id: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(worker) = state.workers.get_mut(worker_id) else {
            return Err(StoreError::UnknownWorker {
                worker_id: worker_id.clone(),
            });
        };
        worker.last_heartbeat = now;

        let mut cancelled = Vec::new();
        for item in state.items.values_mut() {
            if item.lease_owner.as_ref() != Some(worker_id) {
                continue;
            }
            match item.status {
                QueueItemStatus::Claimed => item.lease_expires_at = Some(now + lease),
                QueueItemStatus::Cancelled => {
                    item.lease_owner = None;
                    cancelled.push(item.id);
                }
                _ => {}
            }
        }
        cancelled.sort();
        Ok(cancelled)
    }

    async fn expired_items(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let state = self.state.lock().await;
        let mut expired: Vec<_> = state
            .items
            .values()
            .filter(|item| item.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|item| item.lease_expires_at);
        expired.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(expired)
    }

    async fn items_leased_by(&self, worker_id: &WorkerId) -> Result<Vec<QueueItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .values()
            .filter(|item| item.is_leased_by(worker_id))
            .cloned()
            .collect())
    }

    async fn upsert_worker(&self, worker: &Worker) -> Result<Worker, StoreError> {
        let mut state = self.state.lock().await;
        let stored = match state.workers.get(&worker.id) {
            Some(existing) => Worker {
                registered_at: existing.registered_at,
                ..worker.clone()
            },
            None => worker.clone(),
        };
        state.workers.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<Worker>, StoreError> {
        Ok(self.state.lock().await.workers.get(worker_id).cloned())
    }

    async fn delete_worker(&self, worker_id: &WorkerId) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.workers.remove(worker_id).is_some())
    }
}
