//! Durable execution engine.
//!
//! The engine owns graph logic; workers only execute nodes. Every decision
//! is computed from a fresh [`RunSnapshot`] and applied as one
//! [`RunTransition`] guarded by the run version and the item lease:
//!
//! 1. Read the run, its items and its steps
//! 2. Plan: record the step, decide retry or failure, or compute newly ready nodes
//! 3. Apply atomically; on a version conflict go back to 1
//!
//! No in-process lock is held across these steps, so several engine
//! instances may share one store.

use crate::config::{EngineConfig, chrono_duration};
use crate::error::{EngineError, StoreError};
use crate::frontier::{Completion, Frontier};
use crate::store::{
    ItemChange, ItemGuard, ItemUpdate, RunInsert, RunSnapshot, RunTransition, RunUpdate, Store,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessera_core::{QueueItemId, RunId, TriggerId, WorkerId, WorkflowId};
use tessera_workflow::{
    Envelope, NodeErrorCode, NodeExecutionError, NodeId, NodeRegistry, PlatformError, QueueItem,
    QueueItemStatus, RetryPolicy, Run, RunContext, RunError, RunStatus, Step, StepStatus,
    Workflow, WorkflowCaller, WorkflowNode,
};
use tracing::{debug, info, instrument, warn};

/// What a worker reports for a finished attempt.
///
/// On the wire this is `{"result": <envelope>}` or `{"error": <error>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemOutcome {
    /// The node produced an output envelope.
    Result(Envelope),
    /// The node failed.
    Error(NodeExecutionError),
}

/// A request to start a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRun {
    /// The workflow to run.
    pub workflow_id: WorkflowId,
    /// The trigger that fired, if any.
    pub trigger_id: Option<TriggerId>,
    /// Start at this node instead of every node without predecessors.
    pub entry_node: Option<NodeId>,
    /// Initial payload; a JSON object or null.
    pub payload: JsonValue,
    /// Initial variables.
    pub variables: Map<String, JsonValue>,
    /// Makes creation idempotent per key.
    pub dedupe_key: Option<String>,
}

impl CreateRun {
    /// Creates a request with a null payload and no variables.
    #[must_use]
    pub fn new(workflow_id: WorkflowId) -> Self {
        Self {
            workflow_id,
            trigger_id: None,
            entry_node: None,
            payload: JsonValue::Null,
            variables: Map::new(),
            dedupe_key: None,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the initial variables.
    #[must_use]
    pub fn with_variables(mut self, variables: Map<String, JsonValue>) -> Self {
        self.variables = variables;
        self
    }

    /// Attributes the run to a trigger.
    #[must_use]
    pub fn from_trigger(mut self, trigger_id: TriggerId) -> Self {
        self.trigger_id = Some(trigger_id);
        self
    }

    /// Starts the run at a single node.
    #[must_use]
    pub fn at_node(mut self, node_id: NodeId) -> Self {
        self.entry_node = Some(node_id);
        self
    }

    /// Sets the dedupe key.
    #[must_use]
    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// A run together with its step rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    /// The run.
    #[serde(flatten)]
    pub run: Run,
    /// Step rows in insertion order.
    pub steps: Vec<Step>,
}

/// Why an attempt ended.
#[derive(Debug, Clone)]
enum Attempt {
    Finished(ItemOutcome),
    LeaseExpired,
    Released,
}

/// The durable execution engine.
pub struct Engine<S: Store> {
    store: Arc<S>,
    registry: Arc<NodeRegistry>,
    config: EngineConfig,
}

impl<S: Store> Clone for Engine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: Store> Engine<S> {
    /// Creates an engine over a store and a node registry.
    pub fn new(store: Arc<S>, registry: Arc<NodeRegistry>, config: EngineConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the node registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Validates a request and persists the run with its entry items.
    ///
    /// With a dedupe key that was already used, returns the existing run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Validation`] if the workflow is missing or
    /// malformed, uses an unregistered node type, the payload is neither an
    /// object nor null, or the requested entry node does not exist.
    #[instrument(skip(self, request), fields(workflow_id = %request.workflow_id))]
    pub async fn create_run(&self, request: CreateRun) -> Result<Run, EngineError> {
        let workflow = self
            .store
            .get_workflow(request.workflow_id)
            .await?
            .ok_or_else(|| {
                EngineError::validation(format!("workflow not found: {}", request.workflow_id))
            })?;

        let graph = workflow
            .graph()
            .map_err(|e| EngineError::validation(e.to_string()))?;

        if let Some(node) = workflow
            .nodes
            .iter()
            .find(|node| !self.registry.contains(&node.node_type))
        {
            return Err(EngineError::validation(format!(
                "node {} uses unregistered type {}",
                node.id, node.node_type
            )));
        }

        if !(request.payload.is_object() || request.payload.is_null()) {
            return Err(EngineError::validation(
                "payload must be a JSON object or null",
            ));
        }

        let entry_nodes = match &request.entry_node {
            Some(node_id) if graph.contains(node_id) => vec![node_id.clone()],
            Some(node_id) => {
                return Err(EngineError::validation(format!(
                    "entry node not found: {node_id}"
                )));
            }
            None => graph.entry_nodes(),
        };

        let now = Utc::now();
        let context = RunContext {
            payload: request.payload.clone(),
            variables: request.variables.clone(),
        };
        let run = Run::new(
            workflow.id,
            request.trigger_id,
            context,
            entry_nodes.clone(),
            now,
        );
        let items: Vec<_> = entry_nodes
            .iter()
            .filter_map(|node_id| workflow.find_node(node_id))
            .map(|node| {
                let input = Envelope::initial(request.payload.clone(), request.variables.clone());
                self.new_item(&run, node, input, now)
            })
            .collect();

        match self
            .store
            .insert_run(&run, &items, request.dedupe_key.as_deref())
            .await?
        {
            RunInsert::Created => {
                info!(run_id = %run.id, entry_nodes = items.len(), "run created");
                Ok(run)
            }
            RunInsert::Duplicate(existing) => {
                debug!(run_id = %existing, dedupe_key = ?request.dedupe_key, "run already created");
                self.store
                    .get_run(existing)
                    .await?
                    .ok_or(EngineError::RunNotFound { run_id: existing })
            }
        }
    }

    /// Applies a worker's outcome for an item it holds.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LeaseConflict`] if the worker no longer holds
    /// the item's lease; the outcome must then be discarded.
    #[instrument(skip(self, outcome), fields(worker_id = %worker_id, item_id = %item_id))]
    pub async fn complete_item(
        &self,
        worker_id: &WorkerId,
        item_id: QueueItemId,
        outcome: ItemOutcome,
    ) -> Result<(), EngineError> {
        self.settle(
            item_id,
            ItemGuard::Owner(worker_id.clone()),
            Attempt::Finished(outcome),
            Utc::now(),
        )
        .await
    }

    /// Returns an item held by a departing worker to the queue.
    ///
    /// The interrupted attempt is recorded and the item is requeued with the
    /// next attempt number, regardless of the retry budget.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::LeaseConflict`] if the worker no longer holds
    /// the item.
    #[instrument(skip(self), fields(worker_id = %worker_id, item_id = %item_id))]
    pub async fn release_item(
        &self,
        worker_id: &WorkerId,
        item_id: QueueItemId,
    ) -> Result<(), EngineError> {
        self.settle(
            item_id,
            ItemGuard::Owner(worker_id.clone()),
            Attempt::Released,
            Utc::now(),
        )
        .await
    }

    /// Reclaims items whose lease lapsed at or before `now`.
    ///
    /// Items with budget left go back to the queue with the next attempt
    /// number; the others fail their run with a timeout. Returns the number
    /// of items handled by this call.
    ///
    /// # Errors
    ///
    /// Returns a store error; items handled before it remain handled.
    #[instrument(skip(self))]
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired = self
            .store
            .expired_items(now, self.config.reclaim_batch)
            .await?;

        let mut reclaimed = 0;
        for item in expired {
            match self
                .settle(
                    item.id,
                    ItemGuard::LeaseExpired { now },
                    Attempt::LeaseExpired,
                    now,
                )
                .await
            {
                Ok(()) => {
                    reclaimed += 1;
                    warn!(
                        item_id = %item.id,
                        run_id = %item.run_id,
                        node_id = %item.node_id,
                        attempt = item.attempt,
                        lease_owner = ?item.lease_owner,
                        "lease expired"
                    );
                }
                // completed or reclaimed elsewhere in the meantime
                Err(EngineError::LeaseConflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(reclaimed)
    }

    /// Cancels a run and every outstanding item of it.
    ///
    /// Workers holding cancelled items learn about it on their next
    /// heartbeat.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunTerminal`] if the run already finished and
    /// [`EngineError::RunNotFound`] if it does not exist.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel_run(&self, run_id: RunId) -> Result<Run, EngineError> {
        for round in 0..self.config.max_replans {
            let run = self
                .store
                .get_run(run_id)
                .await?
                .ok_or(EngineError::RunNotFound { run_id })?;
            if run.is_terminal() {
                return Err(EngineError::RunTerminal {
                    run_id,
                    status: run.status,
                });
            }

            let mut transition = RunTransition::new(run_id, run.version);
            transition.run_update = Some(RunUpdate {
                status: RunStatus::Cancelled,
                error: None,
                context: None,
                at: Utc::now(),
            });
            transition.cancel_outstanding = true;

            match self.store.apply_transition(&transition).await {
                Ok(()) => {
                    info!("run cancelled");
                    return self
                        .store
                        .get_run(run_id)
                        .await?
                        .ok_or(EngineError::RunNotFound { run_id });
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(round, "run changed while cancelling, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Contention { run_id })
    }

    /// Reads a run with its steps.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::RunNotFound`] if the run does not exist.
    pub async fn run_details(&self, run_id: RunId) -> Result<RunDetails, EngineError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound { run_id })?;
        let steps = self.store.list_steps(run_id).await?;
        Ok(RunDetails { run, steps })
    }

    async fn settle(
        &self,
        item_id: QueueItemId,
        guard: ItemGuard,
        attempt: Attempt,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let item = self
            .store
            .get_item(item_id)
            .await?
            .ok_or(EngineError::ItemNotFound { item_id })?;
        let run_id = item.run_id;
        let workflow = self
            .store
            .get_workflow(item.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound {
                workflow_id: item.workflow_id,
            })?;

        for round in 0..self.config.max_replans {
            let snapshot = self
                .store
                .load_snapshot(run_id)
                .await?
                .ok_or(EngineError::RunNotFound { run_id })?;
            let item = snapshot
                .item(item_id)
                .ok_or(EngineError::ItemNotFound { item_id })?;
            if snapshot.run.is_terminal() || !guard.admits(item) {
                return Err(EngineError::LeaseConflict { item_id });
            }

            let transition = self.plan(&workflow, &snapshot, item, &guard, &attempt, now)?;
            match self.store.apply_transition(&transition).await {
                Ok(()) => {
                    log_transition(&transition, item);
                    return Ok(());
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(run_id = %run_id, round, "run changed underneath, replanning");
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(run_id = %run_id, item_id = %item_id, "giving up after repeated version conflicts");
        Err(EngineError::Contention { run_id })
    }

    fn plan(
        &self,
        workflow: &Workflow,
        snapshot: &RunSnapshot,
        item: &QueueItem,
        guard: &ItemGuard,
        attempt: &Attempt,
        now: DateTime<Utc>,
    ) -> Result<RunTransition, EngineError> {
        let mut transition = RunTransition::new(snapshot.run.id, snapshot.run.version);
        let node = workflow.find_node(&item.node_id);

        let change = match attempt {
            Attempt::Finished(ItemOutcome::Result(output)) => {
                self.plan_success(workflow, snapshot, item, output, now, &mut transition)?;
                ItemChange::Complete
            }
            Attempt::Finished(ItemOutcome::Error(error)) => {
                // attribute to the item, whatever the worker claimed
                let error = NodeExecutionError {
                    node_id: item.node_id.clone(),
                    node_type: item.node_type.clone(),
                    ..error.clone()
                };
                self.plan_failure(node, item, error, true, now, &mut transition)
            }
            Attempt::LeaseExpired => {
                let error = NodeExecutionError::new(
                    item.node_id.clone(),
                    item.node_type.clone(),
                    NodeErrorCode::Timeout,
                    format!("lease expired during attempt {}", item.attempt),
                );
                self.plan_failure(node, item, error, false, now, &mut transition)
            }
            Attempt::Released => {
                let error = NodeExecutionError::new(
                    item.node_id.clone(),
                    item.node_type.clone(),
                    NodeErrorCode::Cancelled,
                    "worker unregistered before finishing the attempt",
                );
                transition.step = Some(Step::failed(item, error, now));
                ItemChange::Retry {
                    attempt: item.attempt + 1,
                    available_at: now,
                }
            }
        };

        transition.item = Some(ItemUpdate {
            item_id: item.id,
            guard: guard.clone(),
            change,
        });
        Ok(transition)
    }

    fn plan_success(
        &self,
        workflow: &Workflow,
        snapshot: &RunSnapshot,
        item: &QueueItem,
        output: &Envelope,
        now: DateTime<Utc>,
        transition: &mut RunTransition,
    ) -> Result<(), EngineError> {
        let graph = workflow
            .graph()
            .map_err(|e| EngineError::validation(e.to_string()))?;

        let mut completed = self.completions(workflow, snapshot);
        completed.insert(
            item.node_id.clone(),
            Completion::new(output.clone(), self.can_branch(workflow, &item.node_id)),
        );
        let scheduled: HashSet<NodeId> = snapshot
            .items
            .iter()
            .map(|item| item.node_id.clone())
            .collect();

        let frontier = Frontier::evaluate(&graph, &snapshot.run.entry_nodes, &completed, &scheduled);
        for node_id in frontier.ready() {
            let Some(node) = workflow.find_node(&node_id) else {
                continue;
            };
            let Some(input) = frontier.input_for(&graph, &node_id, &completed) else {
                continue;
            };
            transition
                .enqueue
                .push(self.new_item(&snapshot.run, node, input, now));
        }

        transition.step = Some(Step::completed(item, output.clone(), now));

        let outstanding = snapshot
            .items
            .iter()
            .any(|other| other.id != item.id && other.status.is_outstanding());
        if transition.enqueue.is_empty() && !outstanding {
            transition.run_update = Some(RunUpdate {
                status: RunStatus::Completed,
                error: None,
                context: Some(RunContext {
                    payload: snapshot.run.context.payload.clone(),
                    variables: frontier.final_variables(&graph, &completed),
                }),
                at: now,
            });
        }
        Ok(())
    }

    fn plan_failure(
        &self,
        node: Option<&WorkflowNode>,
        item: &QueueItem,
        error: NodeExecutionError,
        backoff: bool,
        now: DateTime<Utc>,
        transition: &mut RunTransition,
    ) -> ItemChange {
        let change = if item.attempt < item.max_attempts {
            let delay = if backoff {
                chrono_duration(self.retry_policy(node).backoff.delay_for(item.attempt))
            } else {
                chrono::Duration::zero()
            };
            ItemChange::Retry {
                attempt: item.attempt + 1,
                available_at: now + delay,
            }
        } else {
            transition.run_update = Some(RunUpdate {
                status: RunStatus::Failed,
                error: Some(RunError::from_node_error(&error, item.attempt)),
                context: None,
                at: now,
            });
            transition.cancel_outstanding = true;
            ItemChange::Fail
        };
        transition.step = Some(Step::failed(item, error, now));
        change
    }

    fn completions(&self, workflow: &Workflow, snapshot: &RunSnapshot) -> HashMap<NodeId, Completion> {
        snapshot
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .filter_map(|step| {
                let output = step.output.clone()?;
                let can_branch = self.can_branch(workflow, &step.node_id);
                Some((step.node_id.clone(), Completion::new(output, can_branch)))
            })
            .collect()
    }

    fn can_branch(&self, workflow: &Workflow, node_id: &NodeId) -> bool {
        workflow
            .find_node(node_id)
            .is_some_and(|node| self.registry.can_branch(&node.node_type))
    }

    fn retry_policy(&self, node: Option<&WorkflowNode>) -> RetryPolicy {
        node.and_then(|node| node.retry)
            .unwrap_or(self.config.default_retry)
    }

    fn new_item(
        &self,
        run: &Run,
        node: &WorkflowNode,
        payload: Envelope,
        now: DateTime<Utc>,
    ) -> QueueItem {
        QueueItem {
            id: QueueItemId::new(),
            run_id: run.id,
            workflow_id: run.workflow_id,
            node_id: node.id.clone(),
            node_type: node.node_type.clone(),
            config: node.config.clone(),
            status: QueueItemStatus::Pending,
            lease_owner: None,
            lease_expires_at: None,
            attempt: 1,
            max_attempts: self.retry_policy(Some(node)).max_attempts,
            timeout_ms: node.timeout_ms,
            payload,
            enqueued_at: now,
            available_at: now,
            claimed_at: None,
        }
    }
}

fn log_transition(transition: &RunTransition, item: &QueueItem) {
    match &transition.run_update {
        Some(update) if update.status == RunStatus::Failed => warn!(
            run_id = %transition.run_id,
            node_id = %item.node_id,
            attempt = item.attempt,
            "run failed"
        ),
        Some(update) => info!(run_id = %transition.run_id, status = %update.status, "run finished"),
        None => debug!(
            run_id = %transition.run_id,
            node_id = %item.node_id,
            enqueued = transition.enqueue.len(),
            "step recorded"
        ),
    }
}

#[async_trait]
impl<S: Store> WorkflowCaller for Engine<S> {
    async fn call_workflow(
        &self,
        workflow_id: WorkflowId,
        payload: JsonValue,
    ) -> Result<RunId, PlatformError> {
        self.create_run(CreateRun::new(workflow_id).with_payload(payload))
            .await
            .map(|run| run.id)
            .map_err(|e| PlatformError::Failed {
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Duration;
    use serde_json::json;
    use tessera_workflow::{Backoff, Edge, Worker};

    struct Harness {
        store: Arc<MemoryStore>,
        engine: Engine<MemoryStore>,
        worker: WorkerId,
    }

    impl Harness {
        async fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let engine = Engine::new(
                store.clone(),
                Arc::new(NodeRegistry::with_builtins()),
                EngineConfig::default(),
            );
            let worker = WorkerId::new("w1").expect("valid id");
            store
                .upsert_worker(&Worker::new(worker.clone(), "w1", 16, Utc::now()))
                .await
                .expect("register");
            Self {
                store,
                engine,
                worker,
            }
        }

        async fn add(&self, workflow: Workflow) -> WorkflowId {
            let id = workflow.id;
            self.store.put_workflow(workflow).await;
            id
        }

        async fn claim(&self) -> Vec<QueueItem> {
            self.store
                .claim_items(&self.worker, 16, Duration::seconds(30), Utc::now())
                .await
                .expect("claim")
        }

        async fn succeed(&self, item: &QueueItem, output: Envelope) {
            self.engine
                .complete_item(&self.worker, item.id, ItemOutcome::Result(output))
                .await
                .expect("complete");
        }

        async fn fail(&self, item: &QueueItem, message: &str) {
            let error = NodeExecutionError::new(
                item.node_id.clone(),
                item.node_type.clone(),
                NodeErrorCode::ExecutionFailed,
                message,
            );
            self.engine
                .complete_item(&self.worker, item.id, ItemOutcome::Error(error))
                .await
                .expect("complete");
        }

        /// Claims and passes through every available item until none is left.
        async fn drive(&self) {
            loop {
                let items = self.claim().await;
                if items.is_empty() {
                    return;
                }
                for item in items {
                    let output = item.payload.derive(&item.node_id);
                    self.succeed(&item, output).await;
                }
            }
        }

        async fn run(&self, run_id: RunId) -> Run {
            self.store
                .get_run(run_id)
                .await
                .expect("get")
                .expect("run exists")
        }
    }

    fn linear() -> Workflow {
        Workflow::new("linear")
            .node(WorkflowNode::new("A", "passthrough"))
            .node(WorkflowNode::new("B", "passthrough"))
            .node(WorkflowNode::new("C", "passthrough"))
            .edge(Edge::new("A", "B"))
            .edge(Edge::new("B", "C"))
    }

    #[tokio::test]
    async fn linear_run_completes_with_ordered_trace() {
        let h = Harness::new().await;
        let workflow_id = h.add(linear()).await;

        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id).with_payload(json!({"x": 1})))
            .await
            .expect("create");
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.entry_nodes, vec![NodeId::from("A")]);

        h.drive().await;

        let details = h.engine.run_details(run.id).await.expect("details");
        assert_eq!(details.run.status, RunStatus::Completed);
        assert!(details.run.completed_at.is_some());
        assert_eq!(details.steps.len(), 3);

        let step_c = &details.steps[2];
        assert_eq!(step_c.node_id, NodeId::from("C"));
        assert_eq!(step_c.input.data, json!({"x": 1}));
        assert_eq!(
            step_c.input.trace.as_slice(),
            &[NodeId::from("A"), NodeId::from("B")]
        );
        let output = step_c.output.as_ref().expect("output");
        assert_eq!(
            output.trace.as_slice(),
            &[NodeId::from("A"), NodeId::from("B"), NodeId::from("C")]
        );
    }

    #[tokio::test]
    async fn diamond_join_waits_and_merges_variables_in_edge_order() {
        let h = Harness::new().await;
        let workflow = Workflow::new("diamond")
            .node(WorkflowNode::new("start", "passthrough"))
            .node(
                WorkflowNode::new("left", "set_variables")
                    .with_config(json!({"side": "left", "left_only": 1})),
            )
            .node(WorkflowNode::new("right", "set_variables").with_config(json!({"side": "right"})))
            .node(WorkflowNode::new("join", "passthrough"))
            .edge(Edge::new("start", "left"))
            .edge(Edge::new("start", "right"))
            .edge(Edge::new("left", "join"))
            .edge(Edge::new("right", "join"));
        let workflow_id = h.add(workflow).await;
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id))
            .await
            .expect("create");

        let start = h.claim().await;
        h.succeed(&start[0], start[0].payload.derive(&start[0].node_id))
            .await;

        let branches = h.claim().await;
        assert_eq!(branches.len(), 2);
        let left = branches
            .iter()
            .find(|i| i.node_id.as_str() == "left")
            .expect("left");
        let right = branches
            .iter()
            .find(|i| i.node_id.as_str() == "right")
            .expect("right");

        // right finishes first, the join must still wait for left
        h.succeed(
            right,
            right
                .payload
                .derive(&right.node_id)
                .with_variable("side", json!("right")),
        )
        .await;
        assert!(h.claim().await.is_empty());

        h.succeed(
            left,
            left.payload
                .derive(&left.node_id)
                .with_variable("side", json!("left"))
                .with_variable("left_only", json!(1)),
        )
        .await;

        let join = h.claim().await;
        assert_eq!(join.len(), 1);
        let input = &join[0].payload;
        assert_eq!(input.data_type, "join");
        assert!(input.data.get("left").is_some());
        assert!(input.data.get("right").is_some());
        // right is declared after left, so it wins
        assert_eq!(input.variables["side"], json!("right"));
        assert_eq!(input.variables["left_only"], json!(1));

        h.succeed(&join[0], join[0].payload.derive(&join[0].node_id))
            .await;
        let run = h.run(run.id).await;
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.context.variables["side"], json!("right"));
    }

    #[tokio::test]
    async fn branch_skips_untaken_path_and_completes() {
        let h = Harness::new().await;
        let workflow = Workflow::new("branch")
            .node(WorkflowNode::new("decide", "branch").with_config(json!({"variable": "route"})))
            .node(WorkflowNode::new("yes", "passthrough"))
            .node(WorkflowNode::new("no", "passthrough"))
            .node(WorkflowNode::new("end", "passthrough"))
            .edge(Edge::new("decide", "yes").on_port("yes"))
            .edge(Edge::new("decide", "no").on_port("no"))
            .edge(Edge::new("yes", "end"))
            .edge(Edge::new("no", "end"));
        let workflow_id = h.add(workflow).await;

        let mut variables = Map::new();
        variables.insert("route".to_string(), json!("yes"));
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id).with_variables(variables))
            .await
            .expect("create");

        let decide = h.claim().await;
        let output = decide[0]
            .payload
            .derive(&decide[0].node_id)
            .with_data("trigger", json!({"_branch": "yes", "v": 1}));
        h.succeed(&decide[0], output).await;

        let next = h.claim().await;
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].node_id, NodeId::from("yes"));
        assert_eq!(next[0].payload.data, json!({"v": 1}));

        h.drive().await;

        let details = h.engine.run_details(run.id).await.expect("details");
        assert_eq!(details.run.status, RunStatus::Completed);
        let executed: Vec<_> = details.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(executed, ["decide", "yes", "end"]);
    }

    #[tokio::test]
    async fn failure_retries_with_backoff_then_fails_run() {
        let h = Harness::new().await;
        let workflow = Workflow::new("flaky")
            .node(WorkflowNode::new("a", "passthrough"))
            .node(WorkflowNode::new("b", "passthrough"))
            .node(
                WorkflowNode::new("flaky", "passthrough").with_retry(RetryPolicy::new(
                    2,
                    Backoff::new(
                        std::time::Duration::from_millis(1),
                        std::time::Duration::from_millis(1),
                    ),
                )),
            );
        let workflow_id = h.add(workflow).await;
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id))
            .await
            .expect("create");

        let items = h.claim().await;
        assert_eq!(items.len(), 3);
        let flaky = items
            .iter()
            .find(|i| i.node_id.as_str() == "flaky")
            .expect("flaky")
            .clone();
        let a = items
            .iter()
            .find(|i| i.node_id.as_str() == "a")
            .expect("a")
            .clone();

        h.succeed(&a, a.payload.derive(&a.node_id)).await;
        let before = Utc::now();
        h.fail(&flaky, "boom").await;

        let requeued = h.store.get_item(flaky.id).await.expect("get").expect("item");
        assert_eq!(requeued.status, QueueItemStatus::Pending);
        assert_eq!(requeued.attempt, 2);
        assert!(requeued.available_at >= before);
        assert_eq!(h.run(run.id).await.status, RunStatus::Running);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let retry = h.claim().await;
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].attempt, 2);
        h.fail(&retry[0], "boom again").await;

        let run = h.run(run.id).await;
        assert_eq!(run.status, RunStatus::Failed);
        let error = run.error.expect("run error");
        assert_eq!(error.node_id, NodeId::from("flaky"));
        assert_eq!(error.message, "boom again");
        assert_eq!(error.code, NodeErrorCode::ExecutionFailed);
        assert_eq!(error.attempt, 2);

        let items = h.store.run_items(run.id).await;
        let b = items
            .iter()
            .find(|i| i.node_id.as_str() == "b")
            .expect("b");
        assert_eq!(b.status, QueueItemStatus::Cancelled);

        let steps = h.store.list_steps(run.id).await.expect("steps");
        assert_eq!(steps.len(), 3);
        assert_eq!(
            steps.iter().filter(|s| s.status == StepStatus::Failed).count(),
            2
        );
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_next_attempt() {
        let h = Harness::new().await;
        let workflow_id = h.add(linear()).await;
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id))
            .await
            .expect("create");

        let claimed = h.claim().await;
        let item = &claimed[0];
        let expiry = item.lease_expires_at.expect("leased");

        assert_eq!(
            h.engine
                .reclaim_expired(expiry - Duration::seconds(1))
                .await
                .expect("sweep"),
            0
        );
        assert_eq!(h.engine.reclaim_expired(expiry).await.expect("sweep"), 1);

        let reclaimed = h.store.get_item(item.id).await.expect("get").expect("item");
        assert_eq!(reclaimed.status, QueueItemStatus::Pending);
        assert_eq!(reclaimed.attempt, item.attempt + 1);
        assert!(reclaimed.lease_owner.is_none());

        let steps = h.store.list_steps(run.id).await.expect("steps");
        let error = steps[0].error.as_ref().expect("error");
        assert_eq!(error.code, NodeErrorCode::Timeout);

        // the original holder can no longer complete it
        let late = h
            .engine
            .complete_item(
                &h.worker,
                item.id,
                ItemOutcome::Result(item.payload.derive(&item.node_id)),
            )
            .await;
        assert!(matches!(late, Err(EngineError::LeaseConflict { .. })));
    }

    #[tokio::test]
    async fn expired_lease_without_budget_fails_run_with_timeout() {
        let h = Harness::new().await;
        let workflow = Workflow::new("once")
            .node(WorkflowNode::new("a", "passthrough").with_retry(RetryPolicy::no_retry()));
        let workflow_id = h.add(workflow).await;
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id))
            .await
            .expect("create");

        let claimed = h.claim().await;
        let expiry = claimed[0].lease_expires_at.expect("leased");
        h.engine.reclaim_expired(expiry).await.expect("sweep");

        let run = h.run(run.id).await;
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.expect("error").code, NodeErrorCode::Timeout);
    }

    #[tokio::test]
    async fn cancel_marks_items_and_rejects_late_completion() {
        let h = Harness::new().await;
        let workflow_id = h.add(linear()).await;
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id))
            .await
            .expect("create");
        let claimed = h.claim().await;

        let cancelled = h.engine.cancel_run(run.id).await.expect("cancel");
        assert_eq!(cancelled.status, RunStatus::Cancelled);

        let item = h
            .store
            .get_item(claimed[0].id)
            .await
            .expect("get")
            .expect("item");
        assert_eq!(item.status, QueueItemStatus::Cancelled);
        assert_eq!(item.lease_owner, Some(h.worker.clone()));

        let late = h
            .engine
            .complete_item(
                &h.worker,
                item.id,
                ItemOutcome::Result(item.payload.derive(&item.node_id)),
            )
            .await;
        assert!(matches!(late, Err(EngineError::LeaseConflict { .. })));

        let again = h.engine.cancel_run(run.id).await;
        assert!(matches!(
            again,
            Err(EngineError::RunTerminal {
                status: RunStatus::Cancelled,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn release_requeues_held_item() {
        let h = Harness::new().await;
        let workflow_id = h.add(linear()).await;
        h.engine
            .create_run(CreateRun::new(workflow_id))
            .await
            .expect("create");
        let claimed = h.claim().await;

        h.engine
            .release_item(&h.worker, claimed[0].id)
            .await
            .expect("release");

        let item = h
            .store
            .get_item(claimed[0].id)
            .await
            .expect("get")
            .expect("item");
        assert_eq!(item.status, QueueItemStatus::Pending);
        assert_eq!(item.attempt, 2);
    }

    #[tokio::test]
    async fn concurrent_completions_enqueue_join_once() {
        let h = Harness::new().await;
        let workflow = Workflow::new("fan-in")
            .node(WorkflowNode::new("a", "passthrough"))
            .node(WorkflowNode::new("b", "passthrough"))
            .node(WorkflowNode::new("c", "passthrough"))
            .node(WorkflowNode::new("join", "passthrough"))
            .edge(Edge::new("a", "join"))
            .edge(Edge::new("b", "join"))
            .edge(Edge::new("c", "join"));
        let workflow_id = h.add(workflow).await;
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id))
            .await
            .expect("create");

        let items = h.claim().await;
        assert_eq!(items.len(), 3);
        let completions = items.iter().map(|item| {
            let engine = h.engine.clone();
            let worker = h.worker.clone();
            let item = item.clone();
            tokio::spawn(async move {
                engine
                    .complete_item(
                        &worker,
                        item.id,
                        ItemOutcome::Result(item.payload.derive(&item.node_id)),
                    )
                    .await
            })
        });
        for handle in completions.collect::<Vec<_>>() {
            handle.await.expect("join").expect("complete");
        }

        let items = h.store.run_items(run.id).await;
        let joins = items
            .iter()
            .filter(|i| i.node_id.as_str() == "join")
            .count();
        assert_eq!(joins, 1);
        // one bump for the claim, one per completion
        assert_eq!(h.run(run.id).await.version, 4);
    }

    #[tokio::test]
    async fn create_run_validation() {
        let h = Harness::new().await;

        let missing = h.engine.create_run(CreateRun::new(WorkflowId::new())).await;
        assert!(matches!(missing, Err(EngineError::Validation { .. })));

        let cyclic = h
            .add(
                Workflow::new("cycle")
                    .node(WorkflowNode::new("a", "passthrough"))
                    .node(WorkflowNode::new("b", "passthrough"))
                    .edge(Edge::new("a", "b"))
                    .edge(Edge::new("b", "a")),
            )
            .await;
        assert!(matches!(
            h.engine.create_run(CreateRun::new(cyclic)).await,
            Err(EngineError::Validation { .. })
        ));

        let unregistered = h
            .add(Workflow::new("unknown type").node(WorkflowNode::new("a", "teleport")))
            .await;
        let err = h
            .engine
            .create_run(CreateRun::new(unregistered))
            .await
            .expect_err("unregistered type");
        assert!(err.to_string().contains("teleport"));

        let linear = h.add(linear()).await;
        assert!(matches!(
            h.engine
                .create_run(CreateRun::new(linear).with_payload(json!([1, 2])))
                .await,
            Err(EngineError::Validation { .. })
        ));
        assert!(matches!(
            h.engine
                .create_run(CreateRun::new(linear).at_node(NodeId::from("Z")))
                .await,
            Err(EngineError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn requested_entry_node_starts_mid_graph() {
        let h = Harness::new().await;
        let workflow_id = h.add(linear()).await;
        let run = h
            .engine
            .create_run(CreateRun::new(workflow_id).at_node(NodeId::from("B")))
            .await
            .expect("create");

        h.drive().await;

        let details = h.engine.run_details(run.id).await.expect("details");
        assert_eq!(details.run.status, RunStatus::Completed);
        let executed: Vec<_> = details.steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(executed, ["B", "C"]);
    }

    #[tokio::test]
    async fn dedupe_key_returns_existing_run() {
        let h = Harness::new().await;
        let workflow_id = h.add(linear()).await;

        let first = h
            .engine
            .create_run(CreateRun::new(workflow_id).with_dedupe_key("trg@1"))
            .await
            .expect("create");
        let second = h
            .engine
            .create_run(CreateRun::new(workflow_id).with_dedupe_key("trg@1"))
            .await
            .expect("create");

        assert_eq!(first.id, second.id);
        assert_eq!(h.claim().await.len(), 1);
    }

    #[tokio::test]
    async fn workflow_caller_starts_runs() {
        let h = Harness::new().await;
        let workflow_id = h.add(linear()).await;

        let run_id = h
            .engine
            .call_workflow(workflow_id, json!({"nested": true}))
            .await
            .expect("call");
        assert_eq!(h.run(run_id).await.context.payload, json!({"nested": true}));

        let err = h
            .engine
            .call_workflow(WorkflowId::new(), JsonValue::Null)
            .await
            .expect_err("unknown workflow");
        assert!(matches!(err, PlatformError::Failed { .. }));
    }
}
