//! Core domain types shared by every tessera crate.
//!
//! This crate provides the strongly-typed identifiers for runs, steps, queue
//! items and workers, plus the `Result` alias used at process boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{
    EnvelopeId, ParseIdError, QueueItemId, RunId, StepId, TriggerId, WorkerId, WorkflowId,
};
