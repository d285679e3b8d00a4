//! The leasing protocol spoken by workers.
//!
//! Items are handed out under a time-bounded lease. A worker keeps its leases
//! alive through heartbeats; once a lease lapses the item is reclaimed and
//! may be claimed by anyone. Completions are accepted only from the current
//! lease holder.

use crate::config::{QueueConfig, chrono_duration};
use crate::engine::{Engine, ItemOutcome};
use crate::error::QueueError;
use crate::protocol::{HeartbeatResponse, WorkerRegistration};
use crate::store::Store;
use chrono::Utc;
use tessera_core::{QueueItemId, WorkerId};
use tessera_workflow::{QueueItem, Worker};
use tracing::{debug, info, instrument, warn};

/// The work queue in front of an [`Engine`].
pub struct WorkQueue<S: Store> {
    engine: Engine<S>,
    config: QueueConfig,
}

impl<S: Store> WorkQueue<S> {
    /// Creates a queue over an engine.
    pub fn new(engine: Engine<S>, config: QueueConfig) -> Self {
        Self { engine, config }
    }

    /// Returns the engine.
    #[must_use]
    pub fn engine(&self) -> &Engine<S> {
        &self.engine
    }

    /// Returns the queue configuration.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Registers a worker, or refreshes an existing registration.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidRequest`] if the concurrency is zero.
    #[instrument(skip(self, registration), fields(worker_id = %registration.id))]
    pub async fn register(&self, registration: &WorkerRegistration) -> Result<Worker, QueueError> {
        if registration.concurrency == 0 {
            return Err(QueueError::InvalidRequest {
                message: "concurrency must be at least 1".to_string(),
            });
        }
        let worker = Worker::new(
            registration.id.clone(),
            registration.name.clone(),
            registration.concurrency,
            Utc::now(),
        );
        let worker = self.engine.store().upsert_worker(&worker).await?;
        info!(concurrency = worker.concurrency, "worker registered");
        Ok(worker)
    }

    /// Records a heartbeat and extends every lease the worker holds.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownWorker`] if the worker is not registered.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn heartbeat(&self, worker_id: &WorkerId) -> Result<HeartbeatResponse, QueueError> {
        let cancelled = self
            .engine
            .store()
            .extend_leases(worker_id, chrono_duration(self.config.lease), Utc::now())
            .await?;
        if !cancelled.is_empty() {
            debug!(cancelled = cancelled.len(), "reporting cancelled items");
        }
        Ok(HeartbeatResponse { cancelled })
    }

    /// Leases up to `max_items` items to the worker, never more than its
    /// registered concurrency.
    ///
    /// Expired leases are reclaimed first, so a lapsed item is claimable by
    /// the next claim even without a running sweeper.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownWorker`] if the worker is not registered.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn claim(
        &self,
        worker_id: &WorkerId,
        max_items: u32,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let worker = self
            .engine
            .store()
            .get_worker(worker_id)
            .await?
            .ok_or_else(|| QueueError::UnknownWorker {
                worker_id: worker_id.clone(),
            })?;

        let now = Utc::now();
        self.engine.reclaim_expired(now).await?;

        let limit = max_items.min(worker.concurrency);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let items = self
            .engine
            .store()
            .claim_items(worker_id, limit, chrono_duration(self.config.lease), now)
            .await?;
        if !items.is_empty() {
            debug!(claimed = items.len(), "items leased");
        }
        Ok(items)
    }

    /// Reports the outcome of an item the worker holds.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseConflict`] if the worker no longer holds
    /// the lease; the outcome is discarded.
    #[instrument(skip(self, outcome), fields(worker_id = %worker_id, item_id = %item_id))]
    pub async fn complete(
        &self,
        worker_id: &WorkerId,
        item_id: QueueItemId,
        outcome: ItemOutcome,
    ) -> Result<(), QueueError> {
        self.ensure_registered(worker_id).await?;
        self.engine.complete_item(worker_id, item_id, outcome).await?;
        Ok(())
    }

    /// Removes a worker and returns the items it still holds to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::UnknownWorker`] if the worker is not registered.
    #[instrument(skip(self), fields(worker_id = %worker_id))]
    pub async fn unregister(&self, worker_id: &WorkerId) -> Result<(), QueueError> {
        self.ensure_registered(worker_id).await?;

        let held = self.engine.store().items_leased_by(worker_id).await?;
        for item in held {
            match self.engine.release_item(worker_id, item.id).await {
                Ok(()) => debug!(item_id = %item.id, "released held item"),
                Err(e) => warn!(item_id = %item.id, error = %e, "could not release held item"),
            }
        }

        if !self.engine.store().delete_worker(worker_id).await? {
            return Err(QueueError::UnknownWorker {
                worker_id: worker_id.clone(),
            });
        }
        info!("worker unregistered");
        Ok(())
    }

    /// Reclaims expired leases. Returns the number of items reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an engine error if the store fails.
    pub async fn sweep(&self) -> Result<usize, QueueError> {
        Ok(self.engine.reclaim_expired(Utc::now()).await?)
    }

    async fn ensure_registered(&self, worker_id: &WorkerId) -> Result<(), QueueError> {
        match self.engine.store().get_worker(worker_id).await? {
            Some(_) => Ok(()),
            None => Err(QueueError::UnknownWorker {
                worker_id: worker_id.clone(),
            }),
        }
    }
}
