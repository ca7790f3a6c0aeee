//! Error types for the scheduler.

use thiserror::Error;

/// Errors that can occur in scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("store error: {0}")]
    Store(#[from] subtide_store::StoreError),

    /// Operation referenced a task name absent from the catalogue.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// A cadence string did not match `"<kind> <count> <unit>"`.
    #[error("invalid frequency {input:?}: {reason}")]
    InvalidFrequency { input: String, reason: String },
}
