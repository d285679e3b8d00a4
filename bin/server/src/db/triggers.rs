//! [`TriggerSource`] over the `triggers` table.

use super::PgStore;
use super::rows::TriggerRow;
use async_trait::async_trait;
use tessera_core::TriggerId;
use tessera_scheduler::{TriggerError, TriggerSource};
use tessera_workflow::Trigger;

fn storage_failed(e: sqlx::Error) -> TriggerError {
    TriggerError::StorageFailed {
        reason: e.to_string(),
    }
}

#[async_trait]
impl TriggerSource for PgStore {
    async fn list_enabled(&self) -> Result<Vec<Trigger>, TriggerError> {
        let rows: Vec<TriggerRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, node_id, config, enabled
            FROM triggers
            WHERE enabled
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_failed)?;

        rows.into_iter()
            .map(|row| row.try_into_record().map_err(storage_failed))
            .collect()
    }

    async fn get(&self, id: TriggerId) -> Result<Option<Trigger>, TriggerError> {
        let row: Option<TriggerRow> = sqlx::query_as(
            r#"
            SELECT id, workflow_id, node_id, config, enabled
            FROM triggers
            WHERE id = $1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_failed)?;

        row.map(TriggerRow::try_into_record)
            .transpose()
            .map_err(storage_failed)
    }
}
