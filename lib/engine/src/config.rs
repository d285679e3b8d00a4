//! Tunables for the engine, the queue and the worker loop.
//!
//! Binaries deserialize their own configuration and convert it into these.

use std::time::Duration;
use tessera_workflow::{Backoff, RetryPolicy};

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Retry policy for nodes that do not declare their own.
    pub default_retry: RetryPolicy,
    /// How many times a transition is replanned after a version conflict.
    pub max_replans: u32,
    /// Upper bound on expired leases handled per sweep.
    pub reclaim_batch: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            max_replans: 8,
            reclaim_batch: 100,
        }
    }
}

/// Queue tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Lease length granted on claim and on every heartbeat.
    pub lease: Duration,
    /// Heartbeat silence after which a worker is reported stale.
    pub stale_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            stale_after: Duration::from_secs(30),
        }
    }
}

/// Worker loop tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Items executed at once.
    pub concurrency: u32,
    /// Delay between claim attempts.
    pub poll_interval: Duration,
    /// Delay between heartbeats.
    pub heartbeat_interval: Duration,
    /// Per-attempt timeout for items without their own.
    pub node_timeout: Duration,
    /// Time in-flight work gets to finish on shutdown.
    pub shutdown_grace: Duration,
    /// Backoff for transient coordinator errors.
    pub coordinator_backoff: Backoff,
    /// Attempts at reporting one completion before giving up on it.
    pub max_report_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            node_timeout: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(30),
            coordinator_backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(10)),
            max_report_attempts: 8,
        }
    }
}

/// Converts a std duration into a chrono one, saturating at a century.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let queue = QueueConfig::default();
        assert_eq!(queue.lease, Duration::from_secs(30));

        let worker = WorkerConfig::default();
        assert_eq!(worker.poll_interval, Duration::from_secs(1));
        assert_eq!(worker.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(worker.node_timeout, Duration::from_secs(300));
        assert_eq!(worker.shutdown_grace, Duration::from_secs(30));

        assert_eq!(EngineConfig::default().default_retry.max_attempts, 5);
    }

    #[test]
    fn chrono_conversion_saturates() {
        assert_eq!(
            chrono_duration(Duration::from_secs(30)),
            chrono::Duration::seconds(30)
        );
        assert_eq!(
            chrono_duration(Duration::MAX),
            chrono::Duration::days(36_500)
        );
    }
}
