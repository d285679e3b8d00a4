//! tessera server.
//!
//! One process hosts the work queue and its HTTP surface, the trigger
//! scheduler, the lease sweeper and, unless disabled, an embedded worker.
//! Runs persist in PostgreSQL when a database is configured and in memory
//! otherwise.

pub mod config;
pub mod db;
pub mod error;
pub mod launcher;
pub mod routes;
pub mod seed;
pub mod state;
pub mod sweeper;

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::launcher::EngineLauncher;
use crate::state::AppState;
use std::sync::Arc;
use tessera_core::WorkerId;
use tessera_engine::{
    EmbeddedCoordinator, Engine, Store, WorkQueue, WorkerLoop, WorkerRegistration,
};
use tessera_scheduler::{TriggerScheduler, TriggerSource};
use tessera_workflow::{NodeRegistry, Platform};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Serves until `shutdown` is cancelled, then waits for background tasks.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or the HTTP server
/// fails.
pub async fn serve<S: Store, T: TriggerSource>(
    config: ServerConfig,
    store: Arc<S>,
    triggers: Arc<T>,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let registry = Arc::new(NodeRegistry::with_builtins());
    let engine = Engine::new(store, registry.clone(), config.engine_config());
    let queue = Arc::new(WorkQueue::new(engine.clone(), config.queue_config()));
    let scheduler = Arc::new(TriggerScheduler::new(
        triggers,
        Arc::new(EngineLauncher::new(engine.clone())),
    ));

    let mut tasks = JoinSet::new();
    tasks.spawn(sweeper::run(
        queue.clone(),
        config.sweep_interval(),
        shutdown.clone(),
    ));

    if config.scheduler.enabled {
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = scheduler.run(shutdown).await {
                error!(error = %e, "trigger scheduler stopped");
            }
        });
    }

    if config.embedded_worker.enabled {
        let worker = embedded_worker(&config, queue.clone(), registry, engine);
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            if let Err(e) = worker.run(shutdown).await {
                error!(error = %e, "embedded worker stopped");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| ServerError::Bind {
            addr: config.bind_addr.clone(),
            details: e.to_string(),
        })?;
    info!(addr = %config.bind_addr, "listening");

    let app = routes::router(AppState::new(queue, scheduler));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .map_err(|e| ServerError::Serve {
            details: e.to_string(),
        });

    // Also reached when serving failed.
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    info!("server stopped");
    served
}

fn embedded_worker<S: Store>(
    config: &ServerConfig,
    queue: Arc<WorkQueue<S>>,
    registry: Arc<NodeRegistry>,
    engine: Engine<S>,
) -> WorkerLoop<EmbeddedCoordinator<S>> {
    let registration = WorkerRegistration {
        id: WorkerId::generate("embedded"),
        name: "embedded".to_string(),
        concurrency: config.embedded_worker.concurrency,
    };
    let platform = Platform::new().with_workflow_caller(Arc::new(engine));
    WorkerLoop::new(
        Arc::new(EmbeddedCoordinator::new(queue)),
        registry,
        platform,
        registration,
        config.worker_config(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_engine::{EngineConfig, MemoryStore, QueueConfig};

    #[test]
    fn embedded_workers_get_distinct_generated_ids() {
        let config: ServerConfig = serde_json::from_value(serde_json::json!({})).expect("config");
        let registry = Arc::new(NodeRegistry::with_builtins());
        let engine = Engine::new(
            Arc::new(MemoryStore::new()),
            registry.clone(),
            EngineConfig::default(),
        );
        let queue = Arc::new(WorkQueue::new(engine.clone(), QueueConfig::default()));

        let first = embedded_worker(&config, queue.clone(), registry.clone(), engine.clone());
        let second = embedded_worker(&config, queue, registry, engine);
        assert!(first.worker_id().as_str().starts_with("embedded-"));
        assert_ne!(first.worker_id(), second.worker_id());
    }
}
