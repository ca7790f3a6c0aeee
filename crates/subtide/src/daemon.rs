//! Daemon command wiring the scheduling engine into the host process,
//! plus the store-facing CLI operations.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tracing::{info, warn};

use subtide_scheduler::{FrequencySource, Scheduler, SchedulerConfig, Task};
use subtide_store::{TaskArgs, TaskStore};

use crate::tasks::{CacheCleanup, StoreBackup};

/// File name of the task store inside the data directory.
const STORE_FILE: &str = "state.json";

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    /// Age in days after which cache files are pruned.
    pub cache_max_age_days: u32,
    /// Number of store backups to keep.
    pub backup_keep: usize,
    /// Delay in seconds before the loops start polling.
    pub startup_delay: u64,
    /// Sleep in seconds between loop passes.
    pub poll_interval: u64,
    /// Sleep in seconds between consecutive task spawns.
    pub spawn_delay: u64,
}

impl DaemonConfig {
    pub fn new(data_dir: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            data_dir,
            cache_dir,
            cache_max_age_days: 14,
            backup_keep: 5,
            startup_delay: 10,
            poll_interval: 1,
            spawn_delay: 5,
        }
    }
}

/// Frequency overrides from `SUBTIDE_TASK_<NAME>_FREQUENCY` environment
/// variables, the task name upcased with `-` mapped to `_`.
pub struct EnvFrequencies;

/// Environment variable carrying the cadence override for `name`.
fn env_key(name: &str) -> String {
    format!(
        "SUBTIDE_TASK_{}_FREQUENCY",
        name.to_uppercase().replace('-', "_")
    )
}

impl FrequencySource for EnvFrequencies {
    fn task_frequency(&self, name: &str) -> Option<String> {
        std::env::var(env_key(name)).ok()
    }
}

/// Open the task store inside `data_dir`.
pub async fn open_store(data_dir: &Path) -> Result<Arc<TaskStore>> {
    TaskStore::open(data_dir.join(STORE_FILE))
        .await
        .map(Arc::new)
        .map_err(|e| miette::miette!("failed to open task store: {}", e))
}

/// Build a scheduler over `store` with the built-in tasks registered.
pub async fn build_scheduler(store: Arc<TaskStore>, config: &DaemonConfig) -> Scheduler {
    let store_path = store.path().to_path_buf();

    let scheduler = Scheduler::builder(store)
        .with_frequencies(EnvFrequencies)
        .with_config(SchedulerConfig {
            startup_delay: Duration::from_secs(config.startup_delay),
            poll_interval: Duration::from_secs(config.poll_interval),
            spawn_delay: Duration::from_secs(config.spawn_delay),
        })
        .build();

    let cache_dir = config.cache_dir.clone();
    let max_age = chrono::Duration::days(i64::from(config.cache_max_age_days));
    scheduler
        .register(move || {
            Arc::new(CacheCleanup::new(cache_dir.clone(), max_age)) as Arc<dyn Task>
        })
        .await;

    let keep = config.backup_keep;
    scheduler
        .register(move || Arc::new(StoreBackup::new(store_path.clone(), keep)) as Arc<dyn Task>)
        .await;

    scheduler
}

/// Run the daemon until interrupted.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!(data_dir = %config.data_dir.display(), "starting subtide daemon");

    let store = open_store(&config.data_dir).await?;

    // Heal running flags a crashed process left behind; nothing can be
    // legitimately in flight before the loops start.
    let recovered = store
        .recover()
        .await
        .map_err(|e| miette::miette!("store recovery failed: {}", e))?;
    if recovered > 0 {
        warn!(count = recovered, "cleared stale running flags from a previous run");
    }

    let scheduler = build_scheduler(store, &config).await;
    scheduler
        .setup_tasks()
        .await
        .map_err(|e| miette::miette!("task setup failed: {}", e))?;

    scheduler.start();

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("failed to listen for shutdown signal: {}", e))?;
    info!("received shutdown signal");
    scheduler.stop();

    info!("daemon shut down");
    Ok(())
}

/// Queue an ad-hoc invocation of `task` directly on the store.
pub async fn dispatch(data_dir: PathBuf, task: &str, args: Vec<String>) -> Result<()> {
    let store = open_store(&data_dir).await?;

    let values = args.into_iter().map(parse_arg).collect();
    store
        .push_queue(TaskArgs::for_task(task, values))
        .await
        .map_err(|e| miette::miette!("failed to queue invocation: {}", e))?;

    println!("queued: {}", task);
    Ok(())
}

/// Interpret a CLI argument as JSON where possible, else as a string.
fn parse_arg(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
}

/// Print every catalogued task with its cadence and run times.
pub async fn list_tasks(config: DaemonConfig) -> Result<()> {
    let store = open_store(&config.data_dir).await?;
    let scheduler = build_scheduler(store, &config).await;
    scheduler
        .setup_tasks()
        .await
        .map_err(|e| miette::miette!("task setup failed: {}", e))?;

    for name in scheduler.task_names().await {
        let running = scheduler.is_task_running(&name).await.unwrap_or(false);
        let last = match scheduler.last_run(&name).await {
            Some(stamp) => stamp.to_rfc3339(),
            None => "never".to_string(),
        };
        let next = match scheduler.next_run(&name).await {
            Some(stamp) => stamp.to_rfc3339(),
            None => "never".to_string(),
        };
        println!(
            "{:<16} running: {:<5} last: {:<33} next: {}",
            name, running, last, next
        );
    }
    Ok(())
}

/// Reset one task's persisted data, or everything when `task` is `None`.
pub async fn clear_data(data_dir: PathBuf, task: Option<&str>) -> Result<()> {
    let store = open_store(&data_dir).await?;
    store
        .clear_task_data(task)
        .await
        .map_err(|e| miette::miette!("failed to clear task data: {}", e))?;

    match task {
        Some(name) => println!("cleared: {}", name),
        None => println!("cleared all task data"),
    }
    Ok(())
}
