//! Error types for the server.
//!
//! - `ServerError`: startup and shutdown failures, reported through rootcause
//! - `ApiError`: request failures, rendered as `{"error": {"code", "message"}}`

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt;
use tessera_engine::{EngineError, ErrorBody, QueueError, StoreError};
use tessera_scheduler::{LaunchError, SchedulerError, TriggerError};
use tracing::error;

/// Process-level server errors.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration could not be loaded.
    Config { details: String },
    /// The database could not be reached.
    Database { details: String },
    /// Migrations failed to apply.
    Migration { details: String },
    /// The seed file could not be read or applied.
    Seed { path: String, details: String },
    /// The listener could not be bound.
    Bind { addr: String, details: String },
    /// The HTTP server stopped with an error.
    Serve { details: String },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "failed to load configuration: {details}"),
            Self::Database { details } => write!(f, "failed to connect to database: {details}"),
            Self::Migration { details } => write!(f, "failed to run migrations: {details}"),
            Self::Seed { path, details } => write!(f, "failed to load seed '{path}': {details}"),
            Self::Bind { addr, details } => write!(f, "failed to bind to '{addr}': {details}"),
            Self::Serve { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// An error returned from an HTTP handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Creates an error with an explicit status and code.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// A malformed request.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// Returns the HTTP status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the machine-readable code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.status, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(code = self.code, message = %self.message, "request failed");
        }
        (self.status, Json(ErrorBody::new(self.code, self.message))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_body", rejection.body_text())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
            }
            StoreError::VersionConflict { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "contention", e.to_string())
            }
            StoreError::UnknownWorker { .. } => {
                Self::new(StatusCode::NOT_FOUND, "unknown_worker", e.to_string())
            }
            StoreError::LeaseConflict { .. } => {
                Self::new(StatusCode::CONFLICT, "lease_conflict", e.to_string())
            }
            StoreError::RunNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "run_not_found", e.to_string())
            }
            StoreError::Corrupt { .. } => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Validation { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", e.to_string())
            }
            EngineError::WorkflowNotFound { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "workflow_not_found", e.to_string())
            }
            EngineError::RunNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "run_not_found", e.to_string())
            }
            EngineError::ItemNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "item_not_found", e.to_string())
            }
            EngineError::RunTerminal { .. } => {
                Self::new(StatusCode::CONFLICT, "run_terminal", e.to_string())
            }
            EngineError::LeaseConflict { .. } => {
                Self::new(StatusCode::CONFLICT, "lease_conflict", e.to_string())
            }
            EngineError::Contention { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "contention", e.to_string())
            }
            EngineError::Store(e) => e.into(),
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::UnknownWorker { .. } => {
                Self::new(StatusCode::NOT_FOUND, "unknown_worker", e.to_string())
            }
            QueueError::LeaseConflict { .. } => {
                Self::new(StatusCode::CONFLICT, "lease_conflict", e.to_string())
            }
            QueueError::InvalidRequest { .. } => Self::bad_request(e.to_string()),
            QueueError::Engine(e) => e.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match &e {
            SchedulerError::Trigger(TriggerError::NotFound { .. }) => {
                Self::new(StatusCode::NOT_FOUND, "trigger_not_found", e.to_string())
            }
            SchedulerError::Trigger(TriggerError::Disabled { .. }) => {
                Self::new(StatusCode::CONFLICT, "trigger_disabled", e.to_string())
            }
            SchedulerError::Trigger(TriggerError::StorageFailed { .. }) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string())
            }
            SchedulerError::Launch {
                source: LaunchError::Rejected { .. },
                ..
            } => Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", e.to_string()),
            SchedulerError::Launch {
                source: LaunchError::Failed { .. },
                ..
            } => Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{QueueItemId, RunId, TriggerId, WorkerId};
    use tessera_workflow::RunStatus;

    #[test]
    fn queue_errors_map_to_protocol_statuses() {
        let unknown: ApiError = QueueError::UnknownWorker {
            worker_id: WorkerId::new("w1").expect("valid id"),
        }
        .into();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let conflict: ApiError = QueueError::LeaseConflict {
            item_id: QueueItemId::new(),
        }
        .into();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
        assert_eq!(conflict.code(), "lease_conflict");

        let invalid: ApiError = QueueError::InvalidRequest {
            message: "concurrency must be positive".to_string(),
        }
        .into();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let unavailable: ApiError = QueueError::Engine(EngineError::Store(StoreError::Unavailable {
            message: "pool timed out".to_string(),
        }))
        .into();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let corrupt: ApiError = QueueError::Engine(EngineError::Store(StoreError::Corrupt {
            message: "bad row".to_string(),
        }))
        .into();
        assert_eq!(corrupt.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn engine_errors_map_to_run_statuses() {
        let validation: ApiError = EngineError::Validation {
            message: "payload must be an object".to_string(),
        }
        .into();
        assert_eq!(validation.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let terminal: ApiError = EngineError::RunTerminal {
            run_id: RunId::new(),
            status: RunStatus::Completed,
        }
        .into();
        assert_eq!(terminal.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn scheduler_errors_map_to_trigger_statuses() {
        let id = TriggerId::new();
        let missing: ApiError = SchedulerError::from(TriggerError::NotFound { id }).into();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let disabled: ApiError = SchedulerError::from(TriggerError::Disabled { id }).into();
        assert_eq!(disabled.status(), StatusCode::CONFLICT);

        let rejected: ApiError = SchedulerError::Launch {
            trigger_id: id,
            source: LaunchError::Rejected {
                reason: "unknown node".to_string(),
            },
        }
        .into();
        assert_eq!(rejected.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
