//! Shared state for HTTP handlers.

use crate::launcher::EngineLauncher;
use std::sync::Arc;
use tessera_engine::{Engine, Store, WorkQueue};
use tessera_scheduler::{TriggerScheduler, TriggerSource};

/// The scheduler as wired into the server.
pub type Scheduler<S, T> = TriggerScheduler<T, EngineLauncher<S>>;

/// Application state shared across handlers.
pub struct AppState<S: Store, T: TriggerSource> {
    /// The leasing protocol, and through it the engine.
    pub queue: Arc<WorkQueue<S>>,
    /// Entry point for firing triggers.
    pub scheduler: Arc<Scheduler<S, T>>,
}

impl<S: Store, T: TriggerSource> AppState<S, T> {
    /// Creates the state.
    #[must_use]
    pub fn new(queue: Arc<WorkQueue<S>>, scheduler: Arc<Scheduler<S, T>>) -> Self {
        Self { queue, scheduler }
    }

    /// Returns the engine.
    #[must_use]
    pub fn engine(&self) -> &Engine<S> {
        self.queue.engine()
    }
}

impl<S: Store, T: TriggerSource> Clone for AppState<S, T> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}
