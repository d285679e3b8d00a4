//! PostgreSQL persistence for tessera.
//!
//! [`PgStore`] implements the engine's [`Store`](tessera_engine::Store) and
//! the scheduler's [`TriggerSource`](tessera_scheduler::TriggerSource) over
//! the tables created by `migrations/`:
//!
//! - `workflows`, `triggers`: definitions, read only
//! - `runs`, `steps`, `queue_items`: execution state
//! - `workers`: registered workers and their heartbeats
//!
//! Every store operation is a single statement or a single transaction, so
//! several server processes may share one database.

mod rows;
mod store;
mod triggers;

use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use tessera_engine::StoreError;

/// Store backed by a PostgreSQL pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a store over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns the pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Maps a database error onto the store taxonomy.
///
/// Rows that fail to decode are corrupt; anything else is treated as the
/// database being unavailable.
pub(crate) fn store_error(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::Decode(_)
        | sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt {
            message: e.to_string(),
        },
        other => StoreError::Unavailable {
            message: other.to_string(),
        },
    }
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<JsonValue, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        message: e.to_string(),
    })
}
