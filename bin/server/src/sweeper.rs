//! Periodic reclaim of expired leases.

use std::sync::Arc;
use std::time::Duration;
use tessera_engine::{Store, WorkQueue};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sweeps expired leases every `interval` until `shutdown` is cancelled.
///
/// Claims also reclaim lazily; the sweep bounds how long an abandoned item
/// waits when nobody is claiming.
pub async fn run<S: Store>(
    queue: Arc<WorkQueue<S>>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                debug!("lease sweeper stopped");
                return;
            }
            _ = ticker.tick() => {}
        }
        match queue.sweep().await {
            Ok(0) => {}
            Ok(count) => info!(reclaimed = count, "reclaimed expired leases"),
            Err(e) => warn!(error = %e, "lease sweep failed"),
        }
    }
}
