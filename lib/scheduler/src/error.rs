//! Error types for the scheduler crate.
//!
//! - `TriggerError`: trigger lookup failures
//! - `ScheduleError`: cron parsing failures
//! - `LaunchError`: failures reported by the run launcher
//! - `SchedulerError`: what callers of the scheduler see

use std::fmt;
use tessera_core::TriggerId;

/// Errors from trigger lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    /// Trigger not found.
    NotFound { id: TriggerId },
    /// Trigger exists but is disabled.
    Disabled { id: TriggerId },
    /// Storage operation failed.
    StorageFailed { reason: String },
}

impl fmt::Display for TriggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "trigger not found: {id}"),
            Self::Disabled { id } => write!(f, "trigger is disabled: {id}"),
            Self::StorageFailed { reason } => {
                write!(f, "trigger storage failed: {reason}")
            }
        }
    }
}

impl std::error::Error for TriggerError {}

/// Errors from schedule operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    /// Invalid cron expression.
    InvalidCronExpression { expression: String, reason: String },
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCronExpression { expression, reason } => {
                write!(f, "invalid cron expression '{expression}': {reason}")
            }
        }
    }
}

impl std::error::Error for ScheduleError {}

/// Errors from starting a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    /// The run was refused, e.g. the workflow is invalid.
    Rejected { reason: String },
    /// The run could not be started right now.
    Failed { reason: String },
}

impl fmt::Display for LaunchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { reason } => write!(f, "run rejected: {reason}"),
            Self::Failed { reason } => write!(f, "run launch failed: {reason}"),
        }
    }
}

impl std::error::Error for LaunchError {}

/// High-level scheduler errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Trigger lookup failed.
    Trigger(TriggerError),
    /// The launcher could not start the run.
    Launch {
        trigger_id: TriggerId,
        source: LaunchError,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trigger(e) => write!(f, "{e}"),
            Self::Launch { trigger_id, source } => {
                write!(f, "firing trigger {trigger_id} failed: {source}")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<TriggerError> for SchedulerError {
    fn from(e: TriggerError) -> Self {
        Self::Trigger(e)
    }
}
