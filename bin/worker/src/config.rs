//! Worker configuration.
//!
//! Loaded from `TESSERA_WORKER_`-prefixed environment variables, e.g.
//! `TESSERA_WORKER_COORDINATOR_URL` and `TESSERA_WORKER_CONCURRENCY`.

use serde::Deserialize;
use std::time::Duration;
use tessera_core::{ParseIdError, WorkerId};
use tessera_engine::WorkerConfig;

/// Worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Base URL of the tessera server.
    #[serde(default = "default_coordinator_url")]
    pub coordinator_url: String,

    /// Worker id. A generated `worker-<ulid>` is used when absent.
    #[serde(default)]
    pub id: Option<String>,

    /// Display name reported on registration.
    #[serde(default = "default_name")]
    pub name: String,

    /// Items executed at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Time in-flight items get to finish on shutdown.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    /// Per-attempt timeout for nodes without their own.
    #[serde(default = "default_node_timeout_seconds")]
    pub node_timeout_seconds: u64,

    /// Timeout of a single request to the coordinator.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_coordinator_url() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_name() -> String {
    "tessera-worker".to_string()
}

fn default_concurrency() -> u32 {
    4
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_shutdown_grace_seconds() -> u64 {
    30
}

fn default_node_timeout_seconds() -> u64 {
    5 * 60
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            coordinator_url: default_coordinator_url(),
            id: None,
            name: default_name(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            node_timeout_seconds: default_node_timeout_seconds(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl WorkerSettings {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but cannot be parsed.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    fn load(source: Option<config::Map<String, String>>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TESSERA_WORKER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(source),
            )
            .build()?
            .try_deserialize()
    }

    /// Returns the configured worker id, or a fresh one.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured id is not a valid worker id.
    pub fn worker_id(&self) -> Result<WorkerId, ParseIdError> {
        match &self.id {
            Some(id) => WorkerId::new(id.as_str()),
            None => Ok(WorkerId::generate("worker")),
        }
    }

    /// Timeout of a single request to the coordinator.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Worker loop tunables.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            node_timeout: Duration::from_secs(self.node_timeout_seconds),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_seconds),
            ..WorkerConfig::default()
        }
    }
}
