//! Built-in maintenance tasks registered by the daemon.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use subtide_scheduler::{SignalOutcome, Task, TaskError};
use subtide_store::{TaskArgs, TaskData};

/// Periodic task that prunes stale files from the daemon cache directory.
///
/// Honors the `"cancel"` signal: an in-flight sweep stops at the next file
/// boundary.
pub struct CacheCleanup {
    root: PathBuf,
    max_age: chrono::Duration,
    removed: AtomicU64,
    cancelled: AtomicBool,
}

impl CacheCleanup {
    pub const NAME: &'static str = "cache-cleanup";

    pub fn new(root: PathBuf, max_age: chrono::Duration) -> Self {
        Self {
            root,
            max_age,
            removed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Task for CacheCleanup {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn periodic(&self) -> bool {
        true
    }

    fn default_frequency(&self) -> Option<&str> {
        Some("interval 12 hours")
    }

    async fn prepare(&self, _args: TaskArgs) -> Result<(), TaskError> {
        self.removed.store(0, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn run(&self) -> Result<(), TaskError> {
        if !self.root.exists() {
            debug!(root = %self.root.display(), "cache directory missing, nothing to sweep");
            return Ok(());
        }

        let max_age = self
            .max_age
            .to_std()
            .map_err(|e| TaskError::new(format!("invalid max age: {}", e)))?;
        let cutoff = SystemTime::now() - max_age;

        let mut removed = 0u64;
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| TaskError::new(format!("reading {}: {}", dir.display(), e)))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| TaskError::new(format!("reading {}: {}", dir.display(), e)))?
            {
                if self.cancelled.load(Ordering::SeqCst) {
                    info!(removed, "cache cleanup cancelled");
                    self.removed.store(removed, Ordering::SeqCst);
                    return Ok(());
                }

                let path = entry.path();
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                        continue;
                    }
                };

                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                if modified < cutoff {
                    match tokio::fs::remove_file(&path).await {
                        Ok(()) => {
                            removed += 1;
                            debug!(path = %path.display(), "removed stale cache file");
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "failed to remove cache file")
                        }
                    }
                }
            }
        }

        self.removed.store(removed, Ordering::SeqCst);
        info!(removed, root = %self.root.display(), "cache cleanup finished");
        Ok(())
    }

    async fn post_run(&self, data: &mut TaskData) -> Result<(), TaskError> {
        let removed = self.removed.load(Ordering::SeqCst);
        let total = data
            .get("total_removed")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        data.insert("last_removed".to_string(), json!(removed));
        data.insert("total_removed".to_string(), json!(total + removed));
        Ok(())
    }

    async fn signal(&self, name: &str, _args: &TaskArgs) -> SignalOutcome {
        match name {
            "cancel" => {
                self.cancelled.store(true, Ordering::SeqCst);
                SignalOutcome::Accepted
            }
            _ => SignalOutcome::Unsupported,
        }
    }
}

/// Periodic task that rotates timestamped copies of the store file.
pub struct StoreBackup {
    store_path: PathBuf,
    keep: usize,
}

impl StoreBackup {
    pub const NAME: &'static str = "store-backup";

    pub fn new(store_path: PathBuf, keep: usize) -> Self {
        Self { store_path, keep }
    }

    fn backup_dir(&self) -> PathBuf {
        self.store_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("backups")
    }

    /// Delete the oldest backups beyond the retention count. Backup names
    /// embed a lexicographically sortable timestamp.
    async fn prune(&self, dir: &Path) -> Result<(), TaskError> {
        let mut backups = Vec::new();
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| TaskError::new(format!("reading {}: {}", dir.display(), e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TaskError::new(format!("reading {}: {}", dir.display(), e)))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("state-") && name.ends_with(".json") {
                backups.push(entry.path());
            }
        }

        backups.sort();
        while backups.len() > self.keep {
            let oldest = backups.remove(0);
            match tokio::fs::remove_file(&oldest).await {
                Ok(()) => debug!(path = %oldest.display(), "pruned old backup"),
                Err(e) => warn!(path = %oldest.display(), error = %e, "failed to prune backup"),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Task for StoreBackup {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn periodic(&self) -> bool {
        true
    }

    fn default_frequency(&self) -> Option<&str> {
        Some("interval 1 days")
    }

    async fn run(&self) -> Result<(), TaskError> {
        if !self.store_path.exists() {
            debug!(path = %self.store_path.display(), "store file missing, nothing to back up");
            return Ok(());
        }

        let dir = self.backup_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TaskError::new(format!("creating {}: {}", dir.display(), e)))?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%9f");
        let target = dir.join(format!("state-{}.json", stamp));
        tokio::fs::copy(&self.store_path, &target)
            .await
            .map_err(|e| TaskError::new(format!("copying to {}: {}", target.display(), e)))?;
        debug!(target = %target.display(), "store backed up");

        self.prune(&dir).await
    }

    async fn post_run(&self, data: &mut TaskData) -> Result<(), TaskError> {
        data.insert("last_backup".to_string(), json!(Utc::now().to_rfc3339()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn touch(path: &std::path::Path) {
        tokio::fs::write(path, b"cached").await.unwrap();
    }

    #[tokio::test]
    async fn cache_cleanup_removes_stale_files() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("sub");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        touch(&dir.path().join("a.srt")).await;
        touch(&nested.join("b.srt")).await;

        // zero max age: everything already on disk is stale
        let task = CacheCleanup::new(dir.path().to_path_buf(), chrono::Duration::zero());
        task.prepare(TaskArgs::new()).await.unwrap();
        task.run().await.unwrap();

        assert!(!dir.path().join("a.srt").exists());
        assert!(!nested.join("b.srt").exists());

        let mut data = TaskData::new();
        task.post_run(&mut data).await.unwrap();
        assert_eq!(data.get("last_removed"), Some(&json!(2)));
        assert_eq!(data.get("total_removed"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn cache_cleanup_keeps_fresh_files() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("fresh.srt")).await;

        let task = CacheCleanup::new(dir.path().to_path_buf(), chrono::Duration::days(30));
        task.prepare(TaskArgs::new()).await.unwrap();
        task.run().await.unwrap();

        assert!(dir.path().join("fresh.srt").exists());
    }

    #[tokio::test]
    async fn cache_cleanup_total_accumulates_across_runs() {
        let dir = tempdir().unwrap();
        let task = CacheCleanup::new(dir.path().to_path_buf(), chrono::Duration::zero());

        let mut data = TaskData::new();
        for round in 1..=2u64 {
            touch(&dir.path().join("stale.srt")).await;
            task.prepare(TaskArgs::new()).await.unwrap();
            task.run().await.unwrap();
            task.post_run(&mut data).await.unwrap();
            assert_eq!(data.get("total_removed"), Some(&json!(round)));
        }
    }

    #[tokio::test]
    async fn cache_cleanup_honors_cancel() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("stale.srt")).await;

        let task = CacheCleanup::new(dir.path().to_path_buf(), chrono::Duration::zero());
        task.prepare(TaskArgs::new()).await.unwrap();

        assert_eq!(
            task.signal("cancel", &TaskArgs::new()).await,
            SignalOutcome::Accepted
        );
        task.run().await.unwrap();

        // the sweep stopped before touching anything
        assert!(dir.path().join("stale.srt").exists());

        // unknown signals are not handled
        assert_eq!(
            task.signal("pause", &TaskArgs::new()).await,
            SignalOutcome::Unsupported
        );
    }

    #[tokio::test]
    async fn store_backup_rotates_old_copies() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("state.json");
        tokio::fs::write(&store_path, b"{}").await.unwrap();

        let task = StoreBackup::new(store_path.clone(), 2);
        for _ in 0..3 {
            task.run().await.unwrap();
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path().join("backups")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        assert_eq!(names.len(), 2, "retention should keep two backups");

        let mut data = TaskData::new();
        task.post_run(&mut data).await.unwrap();
        assert!(data.contains_key("last_backup"));
    }

    #[tokio::test]
    async fn store_backup_tolerates_missing_store() {
        let dir = tempdir().unwrap();
        let task = StoreBackup::new(dir.path().join("state.json"), 2);
        task.run().await.unwrap();
        assert!(!dir.path().join("backups").exists());
    }
}
