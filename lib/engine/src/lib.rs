//! Durable execution for tessera workflows.
//!
//! - [`Store`]: the only shared mutable resource; every run and queue
//!   transition goes through one of its atomic operations
//! - [`Engine`]: creates runs and turns node outcomes into run transitions
//! - [`WorkQueue`]: the leasing protocol workers speak
//! - [`WorkerLoop`]: claims, executes and reports items through a
//!   [`Coordinator`], either in-process ([`EmbeddedCoordinator`]) or remotely
//!
//! [`MemoryStore`] implements [`Store`] for single-process use and tests.

pub mod config;
pub mod embedded;
pub mod engine;
pub mod error;
pub mod frontier;
pub mod memory;
pub mod protocol;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::{EngineConfig, QueueConfig, WorkerConfig};
pub use embedded::EmbeddedCoordinator;
pub use engine::{CreateRun, Engine, ItemOutcome, RunDetails};
pub use error::{EngineError, QueueError, StoreError};
pub use memory::MemoryStore;
pub use protocol::{
    ClaimRequest, CompleteWorkRequest, ErrorBody, ErrorDetail, HeartbeatResponse, WorkerRegistration,
};
pub use queue::WorkQueue;
pub use store::{
    ItemChange, ItemGuard, ItemUpdate, RunInsert, RunSnapshot, RunTransition, RunUpdate, Store,
};
pub use worker::{Coordinator, CoordinatorError, WorkerError, WorkerLoop};
