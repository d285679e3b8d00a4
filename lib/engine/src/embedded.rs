//! In-process coordinator for workers running next to the engine.

use crate::engine::ItemOutcome;
use crate::error::{EngineError, QueueError, StoreError};
use crate::protocol::{HeartbeatResponse, WorkerRegistration};
use crate::queue::WorkQueue;
use crate::store::Store;
use crate::worker::{Coordinator, CoordinatorError};
use async_trait::async_trait;
use std::sync::Arc;
use tessera_core::{QueueItemId, WorkerId};
use tessera_workflow::{QueueItem, Worker};

/// Calls a [`WorkQueue`] directly.
pub struct EmbeddedCoordinator<S: Store> {
    queue: Arc<WorkQueue<S>>,
}

impl<S: Store> EmbeddedCoordinator<S> {
    /// Creates a coordinator over a shared queue.
    pub fn new(queue: Arc<WorkQueue<S>>) -> Self {
        Self { queue }
    }
}

impl From<QueueError> for CoordinatorError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::UnknownWorker { worker_id } => Self::UnknownWorker { worker_id },
            QueueError::LeaseConflict { item_id } => Self::LeaseConflict { item_id },
            QueueError::InvalidRequest { message } => Self::Rejected { message },
            QueueError::Engine(
                e @ (EngineError::Store(StoreError::Unavailable { .. })
                | EngineError::Contention { .. }),
            ) => Self::Transient {
                message: e.to_string(),
            },
            QueueError::Engine(e) => Self::Rejected {
                message: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl<S: Store> Coordinator for EmbeddedCoordinator<S> {
    async fn register(
        &self,
        registration: &WorkerRegistration,
    ) -> Result<Worker, CoordinatorError> {
        Ok(self.queue.register(registration).await?)
    }

    async fn heartbeat(&self, worker_id: &WorkerId) -> Result<HeartbeatResponse, CoordinatorError> {
        Ok(self.queue.heartbeat(worker_id).await?)
    }

    async fn claim(
        &self,
        worker_id: &WorkerId,
        max_items: u32,
    ) -> Result<Vec<QueueItem>, CoordinatorError> {
        Ok(self.queue.claim(worker_id, max_items).await?)
    }

    async fn complete(
        &self,
        worker_id: &WorkerId,
        item_id: QueueItemId,
        outcome: ItemOutcome,
    ) -> Result<(), CoordinatorError> {
        Ok(self.queue.complete(worker_id, item_id, outcome).await?)
    }

    async fn unregister(&self, worker_id: &WorkerId) -> Result<(), CoordinatorError> {
        Ok(self.queue.unregister(worker_id).await?)
    }
}
