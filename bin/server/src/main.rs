use rootcause::Report;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tessera_engine::MemoryStore;
use tessera_scheduler::StaticTriggerSource;
use tessera_server::config::ServerConfig;
use tessera_server::db::PgStore;
use tessera_server::error::ServerError;
use tessera_server::seed::Seed;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Report<ServerError>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().map_err(|e| ServerError::Config {
        details: e.to_string(),
    })?;
    tracing::info!("Loaded configuration");

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

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(&url)
                .await
                .map_err(|e| ServerError::Database {
                    details: e.to_string(),
                })?;

            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .map_err(|e| ServerError::Migration {
                    details: e.to_string(),
                })?;

            let store = Arc::new(PgStore::new(pool));
            tessera_server::serve(config, store.clone(), store, shutdown).await?;
        }
        None => {
            tracing::warn!("No database configured; runs will not survive a restart");
            let store = Arc::new(MemoryStore::new());
            let triggers = Arc::new(StaticTriggerSource::default());
            if let Some(path) = &config.seed_path {
                Seed::read(path)?.apply(&store, &triggers).await;
            }
            tessera_server::serve(config, store, triggers, shutdown).await?;
        }
    }

    Ok(())
}
