//! [`Store`] over PostgreSQL.

use super::rows::{QueueItemRow, RunRow, StepRow, WorkerRow, WorkflowRow};
use super::{PgStore, store_error, to_json};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Postgres, Transaction};
use tessera_core::{QueueItemId, RunId, WorkerId, WorkflowId};
use tessera_engine::{ItemChange, RunInsert, RunSnapshot, RunTransition, Store, StoreError};
use tessera_workflow::{QueueItem, QueueItemStatus, Run, RunStatus, Step, Worker, Workflow};
use tracing::{debug, instrument};

const ITEM_COLUMNS: &str = "id, run_id, workflow_id, node_id, node_type, config, status, \
     lease_owner, lease_expires_at, attempt, max_attempts, timeout_ms, payload, \
     enqueued_at, available_at, claimed_at";

const RUN_COLUMNS: &str = "id, workflow_id, trigger_id, status, context, entry_nodes, error, \
     created_at, started_at, completed_at, version";

const STEP_COLUMNS: &str =
    "id, run_id, node_id, status, input, output, error, attempt, started_at, completed_at";

fn items(rows: Vec<QueueItemRow>) -> Result<Vec<QueueItem>, StoreError> {
    rows.into_iter()
        .map(|row| row.try_into_record().map_err(store_error))
        .collect()
}

fn attempt_column(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}

/// Inserts an item unless its node already has one in the run.
async fn insert_item(
    tx: &mut Transaction<'_, Postgres>,
    item: &QueueItem,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO queue_items (
            id, run_id, workflow_id, node_id, node_type, config, status,
            lease_owner, lease_expires_at, attempt, max_attempts, timeout_ms, payload,
            enqueued_at, available_at, claimed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (run_id, node_id) DO NOTHING
        "#,
    )
    .bind(item.id.to_string())
    .bind(item.run_id.to_string())
    .bind(item.workflow_id.to_string())
    .bind(item.node_id.as_str())
    .bind(&item.node_type)
    .bind(&item.config)
    .bind(item.status.as_str())
    .bind(item.lease_owner.as_ref().map(WorkerId::as_str))
    .bind(item.lease_expires_at)
    .bind(attempt_column(item.attempt))
    .bind(attempt_column(item.max_attempts))
    .bind(item.timeout_ms.map(|ms| i64::try_from(ms).unwrap_or(i64::MAX)))
    .bind(to_json(&item.payload)?)
    .bind(item.enqueued_at)
    .bind(item.available_at)
    .bind(item.claimed_at)
    .execute(&mut **tx)
    .await
    .map_err(store_error)?;
    Ok(())
}

async fn insert_step(tx: &mut Transaction<'_, Postgres>, step: &Step) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO steps (
            id, run_id, node_id, status, input, output, error, attempt, started_at, completed_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(step.id.to_string())
    .bind(step.run_id.to_string())
    .bind(step.node_id.as_str())
    .bind(step.status.as_str())
    .bind(to_json(&step.input)?)
    .bind(step.output.as_ref().map(to_json).transpose()?)
    .bind(step.error.as_ref().map(to_json).transpose()?)
    .bind(attempt_column(step.attempt))
    .bind(step.started_at)
    .bind(step.completed_at)
    .execute(&mut **tx)
    .await
    .map_err(store_error)?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            r#"
            SELECT id, name, definition
            FROM workflows
            WHERE id = $1
            "#,
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(WorkflowRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    #[instrument(skip(self, run, items), fields(run_id = %run.id))]
    async fn insert_run(
        &self,
        run: &Run,
        items: &[QueueItem],
        dedupe_key: Option<&str>,
    ) -> Result<RunInsert, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO runs (
                id, workflow_id, trigger_id, status, context, entry_nodes, error,
                created_at, started_at, completed_at, version, dedupe_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (dedupe_key) DO NOTHING
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.trigger_id.map(|id| id.to_string()))
        .bind(run.status.as_str())
        .bind(to_json(&run.context)?)
        .bind(to_json(&run.entry_nodes)?)
        .bind(run.error.as_ref().map(to_json).transpose()?)
        .bind(run.created_at)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.version)
        .bind(dedupe_key)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();

        if inserted == 0 {
            let (existing,): (String,) = sqlx::query_as(
                r#"
                SELECT id FROM runs WHERE dedupe_key = $1
                "#,
            )
            .bind(dedupe_key)
            .fetch_one(&mut *tx)
            .await
            .map_err(store_error)?;
            let existing: RunId = existing.parse().map_err(|e| StoreError::Corrupt {
                message: format!("invalid run id '{existing}': {e}"),
            })?;
            debug!(existing = %existing, "run deduplicated");
            return Ok(RunInsert::Duplicate(existing));
        }

        for item in items {
            insert_item(&mut tx, item).await?;
        }
        tx.commit().await.map_err(store_error)?;
        Ok(RunInsert::Created)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        let row: Option<RunRow> =
            sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
                .bind(run_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;

        row.map(RunRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn load_snapshot(&self, run_id: RunId) -> Result<Option<RunSnapshot>, StoreError> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };

        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE run_id = $1 ORDER BY enqueued_at, id"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(Some(RunSnapshot {
            run,
            items: items(rows)?,
            steps: self.list_steps(run_id).await?,
        }))
    }

    async fn list_steps(&self, run_id: RunId) -> Result<Vec<Step>, StoreError> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE run_id = $1 ORDER BY seq"
        ))
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        rows.into_iter()
            .map(|row| row.try_into_record().map_err(store_error))
            .collect()
    }

    async fn get_item(&self, item_id: QueueItemId) -> Result<Option<QueueItem>, StoreError> {
        let row: Option<QueueItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = $1"
        ))
        .bind(item_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(QueueItemRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    #[instrument(skip(self, transition), fields(run_id = %transition.run_id))]
    async fn apply_transition(&self, transition: &RunTransition) -> Result<(), StoreError> {
        let run_id = transition.run_id;
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        // lock the run, then the guarded item, before checking anything
        let version: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT version FROM runs WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(run_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error)?;
        let Some((version,)) = version else {
            return Err(StoreError::RunNotFound { run_id });
        };

        let mut claimed_at = None;
        if let Some(update) = &transition.item {
            let row: Option<QueueItemRow> = sqlx::query_as(&format!(
                "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = $1 FOR UPDATE"
            ))
            .bind(update.item_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_error)?;
            let item = row
                .map(QueueItemRow::try_into_record)
                .transpose()
                .map_err(store_error)?;
            let admitted = item
                .as_ref()
                .is_some_and(|item| item.run_id == run_id && update.guard.admits(item));
            if !admitted {
                return Err(StoreError::LeaseConflict {
                    item_id: update.item_id,
                });
            }
            claimed_at = item.and_then(|item| item.claimed_at);
        }

        if version != transition.expected_version {
            return Err(StoreError::VersionConflict {
                run_id,
                expected: transition.expected_version,
            });
        }

        if let Some(update) = &transition.item {
            let query = match update.change {
                ItemChange::Complete | ItemChange::Fail => {
                    let status = if update.change == ItemChange::Complete {
                        QueueItemStatus::Completed
                    } else {
                        QueueItemStatus::Failed
                    };
                    sqlx::query(
                        r#"
                        UPDATE queue_items
                        SET status = $2, lease_expires_at = NULL
                        WHERE id = $1
                        "#,
                    )
                    .bind(update.item_id.to_string())
                    .bind(status.as_str())
                }
                ItemChange::Retry {
                    attempt,
                    available_at,
                } => sqlx::query(
                    r#"
                    UPDATE queue_items
                    SET status = 'pending', lease_owner = NULL, lease_expires_at = NULL,
                        claimed_at = NULL, attempt = $2, available_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(update.item_id.to_string())
                .bind(attempt_column(attempt))
                .bind(available_at),
            };
            query.execute(&mut *tx).await.map_err(store_error)?;
        }

        if let Some(step) = &transition.step {
            insert_step(&mut tx, step).await?;
        }

        for item in &transition.enqueue {
            insert_item(&mut tx, item).await?;
        }

        if transition.cancel_outstanding {
            // lease owner kept so the worker hears about it on heartbeat
            sqlx::query(
                r#"
                UPDATE queue_items
                SET status = 'cancelled', lease_expires_at = NULL
                WHERE run_id = $1
                  AND status IN ('pending', 'claimed')
                  AND id IS DISTINCT FROM $2
                "#,
            )
            .bind(run_id.to_string())
            .bind(transition.item.as_ref().map(|update| update.item_id.to_string()))
            .execute(&mut *tx)
            .await
            .map_err(store_error)?;
        }

        // a reported item proves the run started, even if the claim's own
        // run update has not landed yet
        let update = transition.run_update.as_ref();
        sqlx::query(
            r#"
            UPDATE runs
            SET version = version + 1,
                status = COALESCE(
                    $2,
                    CASE WHEN status = 'pending' AND $6::timestamptz IS NOT NULL
                         THEN 'running' ELSE status END
                ),
                started_at = COALESCE(started_at, $6),
                completed_at = COALESCE($3, completed_at),
                error = COALESCE($4, error),
                context = COALESCE($5, context)
            WHERE id = $1
            "#,
        )
        .bind(run_id.to_string())
        .bind(update.map(|u| u.status.as_str()))
        .bind(update.filter(|u| u.status.is_terminal()).map(|u| u.at))
        .bind(
            update
                .and_then(|u| u.error.as_ref())
                .map(to_json)
                .transpose()?,
        )
        .bind(
            update
                .and_then(|u| u.context.as_ref())
                .map(to_json)
                .transpose()?,
        )
        .bind(claimed_at)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;
        Ok(())
    }

    #[instrument(skip(self), fields(worker_id = %worker_id))]
    async fn claim_items(
        &self,
        worker_id: &WorkerId,
        limit: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let (registered,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (SELECT 1 FROM workers WHERE id = $1)
            "#,
        )
        .bind(worker_id.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;
        if !registered {
            return Err(StoreError::UnknownWorker {
                worker_id: worker_id.clone(),
            });
        }

        let rows: Vec<QueueItemRow> = sqlx::query_as(
            r#"
            WITH next AS (
                SELECT id
                FROM queue_items
                WHERE status = 'pending' AND available_at <= $3
                ORDER BY enqueued_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_items
            SET status = 'claimed', lease_owner = $1, lease_expires_at = $4, claimed_at = $3
            FROM next
            WHERE queue_items.id = next.id
            RETURNING queue_items.*
            "#,
        )
        .bind(worker_id.as_str())
        .bind(i64::from(limit))
        .bind(now)
        .bind(now + lease)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        let mut claimed = items(rows)?;
        claimed.sort_by(|a, b| (a.enqueued_at, a.id).cmp(&(b.enqueued_at, b.id)));

        if !claimed.is_empty() {
            // separate statement: the claim must not hold item locks while
            // waiting on run rows locked by transitions. A transition that
            // commits first backfills started_at itself, so this only
            // touches runs still Pending and bumps their version like any
            // other run change.
            let run_ids: Vec<String> = claimed.iter().map(|item| item.run_id.to_string()).collect();
            sqlx::query(
                r#"
                UPDATE runs
                SET status = $2, started_at = COALESCE(started_at, $3), version = version + 1
                WHERE id = ANY($1) AND status = $4
                "#,
            )
            .bind(run_ids)
            .bind(RunStatus::Running.as_str())
            .bind(now)
            .bind(RunStatus::Pending.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_error)?;
        }

        Ok(claimed)
    }

    #[instrument(skip(self), fields(worker_id = %worker_id))]
    async fn extend_leases(
        &self,
        worker_id: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueItemId>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let seen = sqlx::query(
            r#"
            UPDATE workers SET last_heartbeat = $2 WHERE id = $1
            "#,
        )
        .bind(worker_id.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?
        .rows_affected();
        if seen == 0 {
            return Err(StoreError::UnknownWorker {
                worker_id: worker_id.clone(),
            });
        }

        sqlx::query(
            r#"
            UPDATE queue_items
            SET lease_expires_at = $2
            WHERE lease_owner = $1 AND status = 'claimed'
            "#,
        )
        .bind(worker_id.as_str())
        .bind(now + lease)
        .execute(&mut *tx)
        .await
        .map_err(store_error)?;

        let cancelled: Vec<(String,)> = sqlx::query_as(
            r#"
            UPDATE queue_items
            SET lease_owner = NULL
            WHERE lease_owner = $1 AND status = 'cancelled'
            RETURNING id
            "#,
        )
        .bind(worker_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error)?;

        tx.commit().await.map_err(store_error)?;

        let mut ids = cancelled
            .into_iter()
            .map(|(id,)| {
                id.parse::<QueueItemId>().map_err(|e| StoreError::Corrupt {
                    message: format!("invalid queue item id '{id}': {e}"),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        ids.sort();
        Ok(ids)
    }

    async fn expired_items(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM queue_items
            WHERE status = 'claimed' AND lease_expires_at <= $1
            ORDER BY lease_expires_at
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        items(rows)
    }

    async fn items_leased_by(&self, worker_id: &WorkerId) -> Result<Vec<QueueItem>, StoreError> {
        let rows: Vec<QueueItemRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM queue_items
            WHERE status = 'claimed' AND lease_owner = $1
            "#
        ))
        .bind(worker_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;
        items(rows)
    }

    async fn upsert_worker(&self, worker: &Worker) -> Result<Worker, StoreError> {
        let row: WorkerRow = sqlx::query_as(
            r#"
            INSERT INTO workers (id, name, concurrency, last_heartbeat, registered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                concurrency = EXCLUDED.concurrency,
                last_heartbeat = EXCLUDED.last_heartbeat
            RETURNING id, name, concurrency, last_heartbeat, registered_at
            "#,
        )
        .bind(worker.id.as_str())
        .bind(&worker.name)
        .bind(i32::try_from(worker.concurrency).unwrap_or(i32::MAX))
        .bind(worker.last_heartbeat)
        .bind(worker.registered_at)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        row.try_into_record().map_err(store_error)
    }

    async fn get_worker(&self, worker_id: &WorkerId) -> Result<Option<Worker>, StoreError> {
        let row: Option<WorkerRow> = sqlx::query_as(
            r#"
            SELECT id, name, concurrency, last_heartbeat, registered_at
            FROM workers
            WHERE id = $1
            "#,
        )
        .bind(worker_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(WorkerRow::try_into_record)
            .transpose()
            .map_err(store_error)
    }

    async fn delete_worker(&self, worker_id: &WorkerId) -> Result<bool, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM workers WHERE id = $1
            "#,
        )
        .bind(worker_id.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_error)?
        .rows_affected();
        Ok(deleted > 0)
    }
}
