//! Store types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Arbitrary JSON mapping private to a task, read and written by its
/// `post_run` hook.
pub type TaskData = serde_json::Map<String, serde_json::Value>;

/// One ad-hoc invocation request: positional and keyword arguments.
///
/// By convention the first positional argument is the target task name;
/// the queue loop interprets it and forwards the rest to the task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    /// Positional arguments, in order.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}

impl TaskArgs {
    /// Empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an invocation request targeting `task`, with `args` forwarded
    /// to it as positional arguments.
    pub fn for_task(task: &str, args: Vec<serde_json::Value>) -> Self {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(serde_json::Value::String(task.to_string()));
        all.extend(args);
        Self {
            args: all,
            kwargs: serde_json::Map::new(),
        }
    }

    /// Add a keyword argument.
    pub fn with_kwarg(mut self, key: &str, value: serde_json::Value) -> Self {
        self.kwargs.insert(key.to_string(), value);
        self
    }

    /// First positional argument, if it is a string.
    pub fn first_str(&self) -> Option<&str> {
        self.args.first().and_then(|v| v.as_str())
    }

    /// These arguments without the first positional one.
    pub fn tail(&self) -> TaskArgs {
        TaskArgs {
            args: self.args.iter().skip(1).cloned().collect(),
            kwargs: self.kwargs.clone(),
        }
    }
}

/// Durable record for one task name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task-private data, handed to `post_run` on every run.
    #[serde(default)]
    pub data: TaskData,
    /// Single-flight gate; owned by the scheduler during a run.
    #[serde(default)]
    pub running: bool,
    /// When the last run attempt finished, successful or not.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
}

/// Outcome of the atomic single-flight check-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunGate {
    /// The running flag was clear and has been set; the caller owns the run.
    Started,
    /// Another run is in flight; the caller must back off.
    AlreadyRunning,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_args_name_convention() {
        let args = TaskArgs::for_task("cleanup", vec![json!(7), json!("deep")])
            .with_kwarg("dry_run", json!(true));

        assert_eq!(args.first_str(), Some("cleanup"));

        let tail = args.tail();
        assert_eq!(tail.args, vec![json!(7), json!("deep")]);
        assert_eq!(tail.kwargs.get("dry_run"), Some(&json!(true)));
    }

    #[test]
    fn task_args_tail_of_empty() {
        let args = TaskArgs::new();
        assert_eq!(args.first_str(), None);
        assert_eq!(args.tail(), TaskArgs::new());
    }

    #[test]
    fn task_args_first_str_requires_string() {
        let args = TaskArgs {
            args: vec![json!(42)],
            kwargs: serde_json::Map::new(),
        };
        assert_eq!(args.first_str(), None);
    }

    #[test]
    fn task_record_deserializes_missing_fields() {
        let record: TaskRecord = serde_json::from_str("{}").unwrap();
        assert!(record.data.is_empty());
        assert!(!record.running);
        assert!(record.last_run.is_none());
    }
}
