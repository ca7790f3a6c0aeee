//! The task contract every collaborator implements.

use async_trait::async_trait;
use thiserror::Error;

use subtide_store::{TaskArgs, TaskData};

/// Error raised by a task lifecycle hook.
///
/// The scheduler logs these and moves on; they never propagate to the
/// loops or to other tasks.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct TaskError(String);

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for TaskError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for TaskError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// How a running task responded to a broadcast signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The task will react to the signal.
    Accepted,
    /// The task understood the signal and chose not to react.
    Declined,
    /// The task has no handler for this signal.
    Unsupported,
}

/// A named, independently-failing unit of work.
///
/// Instantiated once at registry setup time and never destroyed while the
/// process is alive. The engine owns the running flag and last-run stamp;
/// tasks read them through the scheduler, never mutate them.
#[async_trait]
pub trait Task: Send + Sync {
    /// Stable unique identifier.
    fn name(&self) -> &str;

    /// Whether this task is eligible for automatic, cadence-based runs.
    /// Dispatch-only tasks return false.
    fn periodic(&self) -> bool;

    /// Built-in cadence string (e.g. `"interval 6 hours"`), used when no
    /// user preference overrides it. `None` means "never auto-run".
    fn default_frequency(&self) -> Option<&str> {
        None
    }

    /// Receive the invocation arguments before `run`.
    async fn prepare(&self, args: TaskArgs) -> Result<(), TaskError> {
        let _ = args;
        Ok(())
    }

    /// Do the work.
    async fn run(&self) -> Result<(), TaskError>;

    /// Finalization hook, called after every run attempt with the task's
    /// persisted private data; mutations are written back.
    async fn post_run(&self, data: &mut TaskData) -> Result<(), TaskError> {
        let _ = data;
        Ok(())
    }

    /// Cooperative signal handler, only invoked while the task is running.
    async fn signal(&self, name: &str, args: &TaskArgs) -> SignalOutcome {
        let _ = (name, args);
        SignalOutcome::Unsupported
    }
}

/// Source of user-configured cadence strings, looked up by task name.
pub trait FrequencySource: Send + Sync {
    fn task_frequency(&self, name: &str) -> Option<String>;
}

/// Frequency source with no overrides; every task keeps its built-in
/// default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOverrides;

impl FrequencySource for NoOverrides {
    fn task_frequency(&self, _name: &str) -> Option<String> {
        None
    }
}

impl FrequencySource for std::collections::HashMap<String, String> {
    fn task_frequency(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}
