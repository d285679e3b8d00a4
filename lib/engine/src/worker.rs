//! The worker loop.
//!
//! Workers execute nodes; the engine handles graph logic. A worker:
//! 1. Registers with a [`Coordinator`]
//! 2. Claims up to its free capacity on every poll tick
//! 3. Executes each item in its own task under a timeout and a cancellation token
//! 4. Reports the outcome
//!
//! A separate task heartbeats on its own interval, keeping leases alive and
//! relaying cancellations to in-flight items.

use crate::config::WorkerConfig;
use crate::engine::ItemOutcome;
use crate::protocol::{HeartbeatResponse, WorkerRegistration};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{QueueItemId, WorkerId};
use tessera_workflow::{
    Envelope, ExecutionContext, NodeErrorCode, NodeExecutionError, NodeRegistry, Platform,
    QueueItem, RegistryError, Worker,
};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// The worker side of the leasing protocol.
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Registers the worker, or refreshes its registration.
    async fn register(&self, registration: &WorkerRegistration)
    -> Result<Worker, CoordinatorError>;

    /// Extends the worker's leases; returns items cancelled since last time.
    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<HeartbeatResponse, CoordinatorError>;

    /// Leases up to `max_items` items.
    async fn claim(
        &self,
        worker_id: &WorkerId,
        max_items: u32,
    ) -> Result<Vec<QueueItem>, CoordinatorError>;

    /// Reports the outcome of a held item.
    async fn complete(
        &self,
        worker_id: &WorkerId,
        item_id: QueueItemId,
        outcome: ItemOutcome,
    ) -> Result<(), CoordinatorError>;

    /// Removes the worker and releases what it still holds.
    async fn unregister(&self, worker_id: &WorkerId) -> Result<(), CoordinatorError>;
}

/// Errors a coordinator reports to the worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The coordinator does not know this worker; register again.
    UnknownWorker { worker_id: WorkerId },
    /// The worker no longer holds the item; discard the outcome.
    LeaseConflict { item_id: QueueItemId },
    /// The coordinator could not be reached or failed transiently; try again later.
    Transient { message: String },
    /// The request was refused and retrying it will not help.
    Rejected { message: String },
}

impl CoordinatorError {
    /// Returns true if the same request may succeed later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownWorker { worker_id } => write!(f, "unknown worker: {worker_id}"),
            Self::LeaseConflict { item_id } => write!(f, "lease conflict on item {item_id}"),
            Self::Transient { message } => write!(f, "coordinator unavailable: {message}"),
            Self::Rejected { message } => write!(f, "request rejected: {message}"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

/// Errors that stop a worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// A node type failed to initialize.
    Registry(RegistryError),
    /// The coordinator refused the registration.
    Registration(CoordinatorError),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "node registry error: {e}"),
            Self::Registration(e) => write!(f, "registration failed: {e}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<RegistryError> for WorkerError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

type InFlight = Arc<Mutex<HashMap<QueueItemId, CancellationToken>>>;

struct Shared<C> {
    coordinator: Arc<C>,
    registry: Arc<NodeRegistry>,
    platform: Platform,
    registration: WorkerRegistration,
    config: WorkerConfig,
    in_flight: InFlight,
}

/// A worker executing items claimed from a [`Coordinator`].
pub struct WorkerLoop<C: Coordinator> {
    shared: Arc<Shared<C>>,
}

impl<C: Coordinator> WorkerLoop<C> {
    /// Creates a worker loop.
    ///
    /// The registration's concurrency is taken from `config`.
    pub fn new(
        coordinator: Arc<C>,
        registry: Arc<NodeRegistry>,
        platform: Platform,
        registration: WorkerRegistration,
        config: WorkerConfig,
    ) -> Self {
        let registration = WorkerRegistration {
            concurrency: config.concurrency.max(1),
            ..registration
        };
        Self {
            shared: Arc::new(Shared {
                coordinator,
                registry,
                platform,
                registration,
                config,
                in_flight: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// Returns the worker id.
    #[must_use]
    pub fn worker_id(&self) -> &WorkerId {
        &self.shared.registration.id
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// On shutdown the loop stops claiming, gives in-flight items the
    /// configured grace period, aborts the rest and unregisters.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] if a node type fails to initialize or the
    /// coordinator rejects the registration.
    #[instrument(skip_all, fields(worker_id = %self.shared.registration.id))]
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        let shared = self.shared;
        shared.registry.initialize_all(&shared.platform).await?;

        if !shared.register_until_accepted(&shutdown).await? {
            return Ok(());
        }
        info!(
            concurrency = shared.registration.concurrency,
            "worker started"
        );

        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(shared.clone(), heartbeat_stop.clone()));

        let mut tasks = JoinSet::new();
        let mut poll = tokio::time::interval(shared.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut claim_failures = 0u32;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "item task failed");
                    }
                }
                _ = poll.tick() => {}
            }

            let capacity = shared
                .registration
                .concurrency
                .saturating_sub(u32::try_from(tasks.len()).unwrap_or(u32::MAX));
            if capacity == 0 {
                continue;
            }

            match shared
                .coordinator
                .claim(&shared.registration.id, capacity)
                .await
            {
                Ok(items) => {
                    claim_failures = 0;
                    for item in items {
                        let token = CancellationToken::new();
                        shared.in_flight.lock().await.insert(item.id, token.clone());
                        tasks.spawn(process(shared.clone(), item, token));
                    }
                }
                Err(CoordinatorError::UnknownWorker { .. }) => {
                    warn!("coordinator forgot this worker, registering again");
                    if !shared.register_until_accepted(&shutdown).await? {
                        break;
                    }
                }
                Err(e) if e.is_transient() => {
                    claim_failures += 1;
                    let delay = shared.config.coordinator_backoff.delay_for(claim_failures);
                    warn!(error = %e, delay_ms = delay.as_millis(), "claim failed, backing off");
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => warn!(error = %e, "claim rejected"),
            }
        }

        info!(in_flight = tasks.len(), "worker stopping");
        drain(&shared, &mut tasks).await;
        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            error!(error = %e, "heartbeat task failed");
        }

        if let Err(e) = shared.coordinator.unregister(&shared.registration.id).await {
            warn!(error = %e, "could not unregister");
        }
        info!("worker stopped");
        Ok(())
    }
}

impl<C: Coordinator> Shared<C> {
    /// Registers, retrying transient failures. Returns false if shutdown
    /// was requested first.
    async fn register_until_accepted(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<bool, WorkerError> {
        let mut failures = 0u32;
        loop {
            match self.coordinator.register(&self.registration).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_transient() => {
                    failures += 1;
                    let delay = self.config.coordinator_backoff.delay_for(failures);
                    warn!(error = %e, delay_ms = delay.as_millis(), "registration failed, backing off");
                    tokio::select! {
                        () = shutdown.cancelled() => return Ok(false),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(WorkerError::Registration(e)),
            }
        }
    }

    async fn execute(&self, item: &QueueItem, token: &CancellationToken) -> ItemOutcome {
        let Some(node_type) = self.registry.get(&item.node_type) else {
            return failure(
                item,
                NodeErrorCode::UnsupportedNodeType,
                format!("node type {} is not registered on this worker", item.node_type),
            );
        };

        let ctx = ExecutionContext::new(
            item.run_id,
            item.workflow_id,
            item.node_id.clone(),
            item.node_type.clone(),
            item.attempt,
            self.platform.clone(),
            token.clone(),
        );
        let limit = item
            .timeout_ms
            .map_or(self.config.node_timeout, Duration::from_millis);
        let execution =
            AssertUnwindSafe(node_type.execute_envelope(&ctx, &item.config, &item.payload))
                .catch_unwind();

        // a node that observes its token gets to return first
        let result = tokio::select! {
            biased;
            result = tokio::time::timeout(limit, execution) => result,
            () = token.cancelled() => {
                return failure(item, NodeErrorCode::Cancelled, "attempt cancelled");
            }
        };

        match result {
            Err(_) => failure(
                item,
                NodeErrorCode::Timeout,
                format!("node exceeded its {}ms timeout", limit.as_millis()),
            ),
            Ok(Err(panic)) => failure(
                item,
                NodeErrorCode::ExecutionFailed,
                format!("node panicked: {}", panic_message(panic.as_ref())),
            ),
            Ok(Ok(Err(e))) => ItemOutcome::Error(e),
            Ok(Ok(Ok(output))) => enforce_trace(item, output),
        }
    }

    async fn report(&self, item_id: QueueItemId, outcome: ItemOutcome) {
        let max_attempts = self.config.max_report_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self
                .coordinator
                .complete(&self.registration.id, item_id, outcome.clone())
                .await
            {
                Ok(()) => return,
                Err(CoordinatorError::LeaseConflict { .. }) => {
                    debug!(item_id = %item_id, "lease lost, outcome discarded");
                    return;
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.config.coordinator_backoff.delay_for(attempt);
                    debug!(item_id = %item_id, error = %e, attempt, "report failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(item_id = %item_id, error = %e, "could not report outcome");
                    return;
                }
            }
        }
    }
}

async fn process<C: Coordinator>(shared: Arc<Shared<C>>, item: QueueItem, token: CancellationToken) {
    debug!(
        item_id = %item.id,
        run_id = %item.run_id,
        node_id = %item.node_id,
        attempt = item.attempt,
        "executing item"
    );
    let outcome = shared.execute(&item, &token).await;

    if token.is_cancelled() {
        // the run was cancelled or the worker is stopping; the item is not ours to report
        debug!(item_id = %item.id, "attempt cancelled, not reporting");
    } else {
        if let ItemOutcome::Error(e) = &outcome {
            debug!(item_id = %item.id, code = %e.code, error = %e.message, "attempt failed");
        }
        shared.report(item.id, outcome).await;
    }
    shared.in_flight.lock().await.remove(&item.id);
}

async fn heartbeat_loop<C: Coordinator>(shared: Arc<Shared<C>>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately and registration just happened
    interval.tick().await;

    loop {
        tokio::select! {
            () = stop.cancelled() => return,
            _ = interval.tick() => {}
        }

        match shared.coordinator.heartbeat(&shared.registration.id).await {
            Ok(response) => {
                if response.cancelled.is_empty() {
                    continue;
                }
                let in_flight = shared.in_flight.lock().await;
                for item_id in response.cancelled {
                    if let Some(token) = in_flight.get(&item_id) {
                        info!(item_id = %item_id, "cancelling item");
                        token.cancel();
                    }
                }
            }
            Err(CoordinatorError::UnknownWorker { .. }) => {
                warn!("heartbeat for unknown worker, registering again");
                if let Err(e) = shared.coordinator.register(&shared.registration).await {
                    warn!(error = %e, "re-registration failed");
                }
            }
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }
    }
}

async fn drain<C: Coordinator>(shared: &Shared<C>, tasks: &mut JoinSet<()>) {
    if tasks.is_empty() {
        return;
    }
    let finished = tokio::time::timeout(shared.config.shutdown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            remaining = tasks.len(),
            "shutdown grace elapsed, aborting in-flight items"
        );
        for token in shared.in_flight.lock().await.values() {
            token.cancel();
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

fn failure(item: &QueueItem, code: NodeErrorCode, message: impl Into<String>) -> ItemOutcome {
    ItemOutcome::Error(NodeExecutionError::new(
        item.node_id.clone(),
        item.node_type.clone(),
        code,
        message,
    ))
}

/// Checks that the output trace extends the input trace and ends with the
/// executing node, appending the node if it was left out.
fn enforce_trace(item: &QueueItem, output: Envelope) -> ItemOutcome {
    let input = &item.payload.trace;
    if !output.trace.extends(input) {
        return failure(
            item,
            NodeErrorCode::InvalidOutput,
            "output trace does not extend the input trace",
        );
    }
    if output.trace.len() == input.len() {
        let trace = input.next(&item.node_id);
        return ItemOutcome::Result(output.with_trace(trace));
    }
    if output.trace.last() != Some(&item.node_id) {
        return failure(
            item,
            NodeErrorCode::InvalidOutput,
            format!("output trace must end with node {}", item.node_id),
        );
    }
    ItemOutcome::Result(output)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
