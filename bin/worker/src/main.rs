//! Standalone tessera worker.
//!
//! Registers with a tessera server, claims work over HTTP and executes it
//! with the built-in node types until interrupted.

mod config;
mod error;

use crate::config::WorkerSettings;
use crate::error::WorkerError;
use rootcause::Report;
use std::sync::Arc;
use tessera_engine::{WorkerLoop, WorkerRegistration};
use tessera_remote::RemoteCoordinator;
use tessera_workflow::{NodeRegistry, Platform};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Report<WorkerError>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = WorkerSettings::from_env().map_err(|e| WorkerError::Config {
        details: e.to_string(),
    })?;
    let id = settings.worker_id().map_err(|e| WorkerError::Config {
        details: e.to_string(),
    })?;
    tracing::info!(
        worker_id = %id,
        coordinator = %settings.coordinator_url,
        "Loaded configuration"
    );

    let coordinator = RemoteCoordinator::new(&settings.coordinator_url, settings.request_timeout())
        .map_err(|e| WorkerError::Coordinator {
            details: e.to_string(),
        })?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown requested"),
                Err(e) => tracing::warn!(error = %e, "Failed to listen for ctrl-c"),
            }
            shutdown.cancel();
        }
    });

    let worker = WorkerLoop::new(
        Arc::new(coordinator),
        Arc::new(NodeRegistry::with_builtins()),
        Platform::new(),
        WorkerRegistration {
            id,
            name: settings.name.clone(),
            concurrency: settings.concurrency,
        },
        settings.worker_config(),
    );
    worker
        .run(shutdown)
        .await
        .map_err(|e| WorkerError::Run {
            details: e.to_string(),
        })?;

    tracing::info!("Worker stopped");
    Ok(())
}
