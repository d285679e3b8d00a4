//! Centralized server configuration.
//!
//! Loaded via the `config` crate from `TESSERA_`-prefixed environment
//! variables; nested sections use `__`, e.g. `TESSERA_QUEUE__LEASE_SECONDS`.
//! Without `TESSERA_DATABASE_URL` the server runs against an in-memory store.

use serde::Deserialize;
use std::time::Duration;
use tessera_engine::{EngineConfig, QueueConfig, WorkerConfig};
use tessera_workflow::{Backoff, RetryPolicy};

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL connection URL. In-memory mode when absent.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Address the HTTP surface listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// JSON file of workflows and triggers loaded at startup in in-memory
    /// mode.
    #[serde(default)]
    pub seed_path: Option<String>,

    /// Leasing configuration.
    #[serde(default)]
    pub queue: QueueSettings,

    /// Default retry policy for nodes without their own.
    #[serde(default)]
    pub retry: RetrySettings,

    /// Workers running inside the server process.
    #[serde(default)]
    pub embedded_worker: EmbeddedWorkerSettings,

    /// Trigger scheduler.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

/// Leasing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSettings {
    /// Lease granted on claim and extended on every heartbeat.
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,

    /// Interval between sweeps for expired leases.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,

    /// Heartbeat silence after which a worker is reported stale.
    #[serde(default = "default_stale_after_seconds")]
    pub stale_after_seconds: u64,
}

fn default_lease_seconds() -> u64 {
    30
}

fn default_sweep_interval_seconds() -> u64 {
    15
}

fn default_stale_after_seconds() -> u64 {
    30
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            stale_after_seconds: default_stale_after_seconds(),
        }
    }
}

/// Default retry policy.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// Attempts per node, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on any delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    5 * 60 * 1_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Workers running inside the server process.
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddedWorkerSettings {
    /// Whether the server executes items itself.
    #[serde(default = "default_true")]
    pub enabled: bool,

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
}

fn default_true() -> bool {
    true
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

impl Default for EmbeddedWorkerSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            node_timeout_seconds: default_node_timeout_seconds(),
        }
    }
}

/// Trigger scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Whether schedule triggers fire from this process.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
        }
    }
}

impl ServerConfig {
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
                config::Environment::with_prefix("TESSERA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(source),
            )
            .build()?
            .try_deserialize()
    }

    /// Engine tunables derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_retry: RetryPolicy::new(
                self.retry.max_attempts,
                Backoff::new(
                    Duration::from_millis(self.retry.initial_backoff_ms),
                    Duration::from_millis(self.retry.max_backoff_ms),
                ),
            ),
            ..EngineConfig::default()
        }
    }

    /// Queue tunables derived from this configuration.
    #[must_use]
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            lease: Duration::from_secs(self.queue.lease_seconds),
            stale_after: Duration::from_secs(self.queue.stale_after_seconds),
        }
    }

    /// Interval between lease sweeps.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.queue.sweep_interval_seconds.max(1))
    }

    /// Worker loop tunables for the embedded worker.
    #[must_use]
    pub fn worker_config(&self) -> WorkerConfig {
        let embedded = &self.embedded_worker;
        WorkerConfig {
            concurrency: embedded.concurrency,
            poll_interval: Duration::from_millis(embedded.poll_interval_ms),
            heartbeat_interval: Duration::from_millis(embedded.heartbeat_interval_ms),
            node_timeout: Duration::from_secs(embedded.node_timeout_seconds),
            shutdown_grace: Duration::from_secs(embedded.shutdown_grace_seconds),
            ..WorkerConfig::default()
        }
    }
}
