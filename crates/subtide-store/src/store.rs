//! File-backed task store implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{RunGate, StoreError, TaskArgs, TaskData, TaskRecord};

/// Current store file format version.
const STORE_VERSION: u32 = 1;

/// Store file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    tasks: HashMap<String, TaskRecord>,
    #[serde(default)]
    queue: Vec<TaskArgs>,
    #[serde(default)]
    migrations: HashSet<String>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            tasks: HashMap::new(),
            queue: Vec::new(),
            migrations: HashSet::new(),
        }
    }
}

/// Durable mapping from task name to record, plus the dispatch queue and
/// applied migration keys.
///
/// Every mutating operation flushes to disk before returning, so the store
/// is at most one crash behind. The internal mutex makes each operation a
/// critical section; the running-flag check-and-set and the queue
/// read-and-clear rely on that atomicity.
#[derive(Debug)]
pub struct TaskStore {
    path: PathBuf,
    inner: Mutex<StoreFile>,
}

impl TaskStore {
    /// Open the store at `path`, creating an empty one if the file does
    /// not exist.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let file = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            StoreFile::default()
        };

        Ok(Self {
            path,
            inner: Mutex::new(file),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a default record for `name` if none exists yet.
    pub async fn ensure_task(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(name) {
            return Ok(());
        }
        inner.tasks.insert(name.to_string(), TaskRecord::default());
        Self::flush(&self.path, &inner).await
    }

    /// The task's private data mapping.
    pub async fn task_data(&self, name: &str) -> Result<TaskData, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .tasks
            .get(name)
            .map(|record| record.data.clone())
            .ok_or_else(|| StoreError::TaskMissing(name.to_string()))
    }

    /// Replace the task's private data mapping.
    pub async fn set_task_data(&self, name: &str, data: TaskData) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(name)
            .ok_or_else(|| StoreError::TaskMissing(name.to_string()))?;
        record.data = data;
        Self::flush(&self.path, &inner).await
    }

    /// Reset one task's data and running flag, or every record plus the
    /// queue when `name` is `None`.
    pub async fn clear_task_data(&self, name: Option<&str>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        match name {
            Some(name) => {
                let record = inner
                    .tasks
                    .get_mut(name)
                    .ok_or_else(|| StoreError::TaskMissing(name.to_string()))?;
                record.data = TaskData::new();
                record.running = false;
                debug!(task = name, "task data cleared");
            }
            None => {
                debug!("clearing all task data");
                for record in inner.tasks.values_mut() {
                    record.data = TaskData::new();
                    record.running = false;
                }
                inner.queue.clear();
            }
        }

        Self::flush(&self.path, &inner).await
    }

    /// Atomically claim the single-flight gate for `name`.
    ///
    /// Returns [`RunGate::AlreadyRunning`] without touching state when a
    /// run is in flight. On flush failure the flag is reverted so a failed
    /// claim cannot wedge the gate.
    pub async fn begin_run(&self, name: &str) -> Result<RunGate, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(name)
            .ok_or_else(|| StoreError::TaskMissing(name.to_string()))?;

        if record.running {
            return Ok(RunGate::AlreadyRunning);
        }
        record.running = true;

        if let Err(e) = Self::flush(&self.path, &inner).await {
            if let Some(record) = inner.tasks.get_mut(name) {
                record.running = false;
            }
            return Err(e);
        }
        Ok(RunGate::Started)
    }

    /// Finish a run: write back `data`, clear the running flag, and advance
    /// `last_run`. `last_run` never moves backwards, even if the wall clock
    /// does.
    pub async fn finish_run(&self, name: &str, data: TaskData) -> Result<DateTime<Utc>, StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(name)
            .ok_or_else(|| StoreError::TaskMissing(name.to_string()))?;

        record.data = data;
        record.running = false;
        let stamp = match record.last_run {
            Some(previous) => previous.max(Utc::now()),
            None => Utc::now(),
        };
        record.last_run = Some(stamp);

        Self::flush(&self.path, &inner).await?;
        Ok(stamp)
    }

    /// Whether a run of `name` is currently in flight. Unknown names are
    /// not running.
    pub async fn is_running(&self, name: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.tasks.get(name).is_some_and(|record| record.running)
    }

    /// When the last run attempt of `name` finished.
    pub async fn last_run(&self, name: &str) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock().await;
        inner.tasks.get(name).and_then(|record| record.last_run)
    }

    /// Forget the last run of `name`, making it immediately due.
    pub async fn reset_last_run(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .tasks
            .get_mut(name)
            .ok_or_else(|| StoreError::TaskMissing(name.to_string()))?;
        record.last_run = None;
        Self::flush(&self.path, &inner).await
    }

    /// Append an invocation request to the dispatch queue.
    pub async fn push_queue(&self, entry: TaskArgs) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.queue.push(entry);
        Self::flush(&self.path, &inner).await
    }

    /// Atomically take the entire queue, leaving it empty.
    ///
    /// Entries pushed concurrently land in the next drain; nothing is lost
    /// or handed out twice.
    pub async fn drain_queue(&self) -> Result<Vec<TaskArgs>, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.queue.is_empty() {
            return Ok(Vec::new());
        }
        let drained = std::mem::take(&mut inner.queue);
        Self::flush(&self.path, &inner).await?;
        Ok(drained)
    }

    /// Number of queued invocation requests.
    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Whether the one-time migration `key` has already been applied.
    pub async fn migration_applied(&self, key: &str) -> bool {
        self.inner.lock().await.migrations.contains(key)
    }

    /// Permanently mark the one-time migration `key` as applied.
    pub async fn mark_migration(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.migrations.insert(key.to_string()) {
            return Ok(());
        }
        Self::flush(&self.path, &inner).await
    }

    /// Clear every stale running flag left behind by a crash mid-run.
    ///
    /// Called once at process startup, before any loop starts; a running
    /// flag can only be stale then. Returns how many were cleared.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut cleared = 0;
        for (name, record) in inner.tasks.iter_mut() {
            if record.running {
                debug!(task = %name, "clearing stale running flag");
                record.running = false;
                cleared += 1;
            }
        }
        if cleared > 0 {
            Self::flush(&self.path, &inner).await?;
        }
        Ok(cleared)
    }

    /// Flush the store to disk: write to a temp file, then rename for
    /// atomicity.
    async fn flush(path: &Path, file: &StoreFile) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(file)?;

        let temp_path = path.with_extension("tmp");
        let mut out = fs::File::create(&temp_path).await?;
        out.write_all(content.as_bytes()).await?;
        out.sync_all().await?;

        fs::rename(&temp_path, path).await?;

        Ok(())
    }
}
