//! Scheduler for workflow triggers.
//!
//! This crate provides:
//!
//! - **Trigger sources**: read access to persisted triggers
//! - **Schedules**: 5-field cron parsing and a min-heap of next fire times
//! - **Scheduler**: one loop firing schedule triggers, plus on-demand firing
//!   for webhook, event and manual triggers

pub mod error;
pub mod manager;
pub mod schedule;
pub mod scheduler;

pub use error::{LaunchError, ScheduleError, SchedulerError, TriggerError};
pub use manager::{RunLauncher, StaticTriggerSource, TriggerSource};
pub use schedule::{CronSchedule, FireQueue};
pub use scheduler::TriggerScheduler;
