//! Durable task scheduling engine for subtide.
//!
//! This crate provides the scheduling core of the daemon:
//! - A registry of named tasks, each with a resolved run cadence
//! - A periodic loop that fires recurring tasks when they come due
//! - A persisted dispatch queue for ad-hoc invocations
//! - Single-flight execution: no task ever overlaps itself
//! - Best-effort cooperative signals to running periodic tasks
//! - A one-time migration switch for renamed recurring tasks
//!
//! Task failures are isolated: nothing raised inside a task body reaches
//! the loops or other tasks.

mod error;
mod scheduler;
mod task;
mod types;

pub use error::SchedulerError;
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use task::{FrequencySource, NoOverrides, SignalOutcome, Task, TaskError};
pub use types::{Frequency, FrequencyUnit, MigrationRule, RunOutcome, SchedulerConfig};

pub use subtide_store::{TaskArgs, TaskData, TaskStore};
