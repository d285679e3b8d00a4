//! The trigger scheduler.
//!
//! One task owns a [`FireQueue`] built from the enabled schedule triggers and
//! sleeps until its earliest entry. Webhook, event and manual triggers are
//! fired through [`TriggerScheduler::fire`].

use crate::error::{LaunchError, SchedulerError, TriggerError};
use crate::manager::{RunLauncher, TriggerSource};
use crate::schedule::{CronSchedule, FireQueue};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tessera_core::{RunId, TriggerId};
use tessera_workflow::{Backoff, Trigger, TriggerConfig};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Attempts at starting one scheduled run before the occurrence is given up.
const LAUNCH_ATTEMPTS: u32 = 5;

/// Delay between attempts at starting one scheduled run.
const LAUNCH_BACKOFF: Backoff = Backoff {
    initial_ms: 1_000,
    max_ms: 30_000,
};

/// Wall-clock time derived from the tokio clock.
///
/// Anchoring to [`Instant`] keeps sleeping and fire times consistent,
/// including under a paused test clock.
#[derive(Debug, Clone, Copy)]
struct Clock {
    wall: DateTime<Utc>,
    instant: Instant,
}

impl Clock {
    fn anchor() -> Self {
        Self {
            wall: Utc::now(),
            instant: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.instant.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall + elapsed
    }

    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let offset = (at - self.wall).to_std().unwrap_or_default();
        self.instant + offset
    }
}

/// Fires triggers by starting runs through a [`RunLauncher`].
pub struct TriggerScheduler<S: TriggerSource, L: RunLauncher> {
    source: Arc<S>,
    launcher: Arc<L>,
    reload: Notify,
}

impl<S: TriggerSource, L: RunLauncher> TriggerScheduler<S, L> {
    /// Creates a scheduler.
    pub fn new(source: Arc<S>, launcher: Arc<L>) -> Self {
        Self {
            source,
            launcher,
            reload: Notify::new(),
        }
    }

    /// Asks the running loop to reload triggers from the source.
    pub fn reload(&self) {
        self.reload.notify_one();
    }

    /// Fires a trigger now with the given payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the trigger is unknown or disabled, or the run
    /// could not be started.
    #[instrument(skip(self, payload), fields(trigger_id = %trigger_id))]
    pub async fn fire(
        &self,
        trigger_id: TriggerId,
        payload: JsonValue,
    ) -> Result<RunId, SchedulerError> {
        let trigger = self
            .source
            .get(trigger_id)
            .await?
            .ok_or(TriggerError::NotFound { id: trigger_id })?;
        if !trigger.enabled {
            return Err(TriggerError::Disabled { id: trigger_id }.into());
        }

        let run_id = self
            .launcher
            .launch(&trigger, payload, None)
            .await
            .map_err(|source| SchedulerError::Launch { trigger_id, source })?;
        info!(run_id = %run_id, kind = ?trigger.kind(), "trigger fired");
        Ok(run_id)
    }

    /// Runs the schedule loop until `shutdown` is cancelled.
    ///
    /// Occurrences that passed while the loop was not running are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial trigger load fails. Later reload
    /// failures keep the previous schedule.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SchedulerError> {
        let mut clock = Clock::anchor();
        let (mut queue, mut triggers) = self.load(clock.now()).await?;
        info!(scheduled = queue.len(), "scheduler started");

        loop {
            let wake = queue.next_fire().map(|at| clock.instant_at(at));
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("scheduler stopped");
                    return Ok(());
                }
                () = self.reload.notified() => {
                    clock = Clock::anchor();
                    match self.load(clock.now()).await {
                        Ok(loaded) => {
                            (queue, triggers) = loaded;
                            info!(scheduled = queue.len(), "triggers reloaded");
                        }
                        Err(e) => warn!(error = %e, "trigger reload failed, keeping schedule"),
                    }
                    continue;
                }
                () = sleep_until(wake) => {}
            }

            for (fire_at, trigger_id) in queue.pop_due(clock.now()) {
                let Some(trigger) = triggers.get(&trigger_id) else {
                    continue;
                };
                self.fire_scheduled(trigger, fire_at, &shutdown).await;
            }
        }
    }

    /// Starts the run for one occurrence.
    ///
    /// Transient launch failures are retried with the same dedupe key, so a
    /// retry racing another instance still yields one run.
    async fn fire_scheduled(
        &self,
        trigger: &Trigger,
        fire_at: DateTime<Utc>,
        shutdown: &CancellationToken,
    ) {
        let payload = match &trigger.config {
            TriggerConfig::Schedule { payload, .. } => payload.clone(),
            _ => JsonValue::Null,
        };
        let dedupe_key = format!("{}@{}", trigger.id, fire_at.to_rfc3339());

        for attempt in 1..=LAUNCH_ATTEMPTS {
            let error = match self
                .launcher
                .launch(trigger, payload.clone(), Some(dedupe_key.clone()))
                .await
            {
                Ok(run_id) => {
                    info!(
                        trigger_id = %trigger.id,
                        run_id = %run_id,
                        fire_at = %fire_at,
                        "schedule fired"
                    );
                    return;
                }
                Err(e) => e,
            };

            if matches!(error, LaunchError::Rejected { .. }) || attempt == LAUNCH_ATTEMPTS {
                warn!(
                    trigger_id = %trigger.id,
                    fire_at = %fire_at,
                    attempt,
                    error = %error,
                    "scheduled run could not be started"
                );
                return;
            }

            let delay = LAUNCH_BACKOFF.delay_for(attempt);
            debug!(
                trigger_id = %trigger.id,
                fire_at = %fire_at,
                attempt,
                error = %error,
                ?delay,
                "scheduled launch failed, retrying"
            );
            tokio::select! {
                () = shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn load(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(FireQueue, HashMap<TriggerId, Trigger>), SchedulerError> {
        let mut queue = FireQueue::new();
        let mut triggers = HashMap::new();
        for trigger in self.source.list_enabled().await? {
            let Some(expression) = trigger.cron() else {
                continue;
            };
            match CronSchedule::parse(expression) {
                Ok(schedule) => {
                    debug!(trigger_id = %trigger.id, cron = expression, "scheduling trigger");
                    queue.insert(trigger.id, schedule, now);
                    triggers.insert(trigger.id, trigger);
                }
                Err(e) => warn!(trigger_id = %trigger.id, error = %e, "skipping trigger"),
            }
        }
        Ok((queue, triggers))
    }
}

async fn sleep_until(wake: Option<Instant>) {
    match wake {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
