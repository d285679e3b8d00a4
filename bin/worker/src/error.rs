//! Startup and run failures of the worker process.

use std::fmt;

/// Errors that stop the worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Configuration could not be loaded or is invalid.
    Config { details: String },
    /// The coordinator client could not be built.
    Coordinator { details: String },
    /// The worker loop stopped with an error.
    Run { details: String },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "failed to load configuration: {details}"),
            Self::Coordinator { details } => {
                write!(f, "failed to set up coordinator client: {details}")
            }
            Self::Run { details } => write!(f, "worker stopped: {details}"),
        }
    }
}

impl std::error::Error for WorkerError {}
