//! Scheduling engine implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use subtide_store::{RunGate, TaskArgs, TaskData, TaskStore};

use crate::{
    Frequency, FrequencySource, MigrationRule, NoOverrides, RunOutcome, SchedulerConfig,
    SchedulerError, SignalOutcome, Task,
};

type TaskFactory = Box<dyn Fn() -> Arc<dyn Task> + Send + Sync>;
type HousekeepingHook = Box<dyn Fn() + Send + Sync>;

/// A catalogued task with its resolved run cadence.
struct CatalogueEntry {
    task: Arc<dyn Task>,
    frequency: Option<Frequency>,
}

/// Builder for [`Scheduler`].
pub struct SchedulerBuilder {
    store: Arc<TaskStore>,
    frequencies: Box<dyn FrequencySource>,
    config: SchedulerConfig,
    migration: Option<MigrationRule>,
    housekeeping: Option<HousekeepingHook>,
}

impl SchedulerBuilder {
    /// Use `source` for user-configured cadence lookups.
    pub fn with_frequencies(mut self, source: impl FrequencySource + 'static) -> Self {
        self.frequencies = Box::new(source);
        self
    }

    /// Override the loop timing knobs.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Configure the one-time legacy migration rule.
    pub fn with_migration(mut self, rule: MigrationRule) -> Self {
        self.migration = Some(rule);
        self
    }

    /// Run `hook` after every task invocation, once state is flushed.
    pub fn with_housekeeping(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.housekeeping = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Scheduler {
        let (shutdown, _) = watch::channel(true);
        Scheduler {
            inner: Arc::new(SchedulerInner {
                store: self.store,
                frequencies: self.frequencies,
                config: self.config,
                migration: self.migration,
                housekeeping: self.housekeeping,
                registry: Mutex::new(Vec::new()),
                catalogue: RwLock::new(HashMap::new()),
                shutdown,
                started: AtomicBool::new(false),
            }),
        }
    }
}

/// The scheduling engine.
///
/// Owns two cooperative loops (periodic scheduling and queue draining) and
/// the single-flight `run_task` entry point both funnel through. All
/// durable state lives in the [`TaskStore`]; the scheduler itself only
/// holds the task catalogue.
///
/// Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    store: Arc<TaskStore>,
    frequencies: Box<dyn FrequencySource>,
    config: SchedulerConfig,
    migration: Option<MigrationRule>,
    housekeeping: Option<HousekeepingHook>,
    registry: Mutex<Vec<TaskFactory>>,
    catalogue: RwLock<HashMap<String, CatalogueEntry>>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Scheduler {
    /// Start building a scheduler over `store`.
    pub fn builder(store: Arc<TaskStore>) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            frequencies: Box::new(NoOverrides),
            config: SchedulerConfig::default(),
            migration: None,
            housekeeping: None,
        }
    }

    /// Scheduler over `store` with default timing and no frequency
    /// overrides.
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self::builder(store).build()
    }

    /// The store backing this scheduler.
    pub fn store(&self) -> &Arc<TaskStore> {
        &self.inner.store
    }

    /// Register a task constructor. Instantiation happens in
    /// [`Scheduler::setup_tasks`].
    pub async fn register<F>(&self, factory: F)
    where
        F: Fn() -> Arc<dyn Task> + Send + Sync + 'static,
    {
        self.inner.registry.lock().await.push(Box::new(factory));
    }

    /// Instantiate every registered task and resolve its effective
    /// cadence: a user-configured string wins over the task's built-in
    /// default.
    ///
    /// Fully replaces the catalogue; calling again re-reads preferences
    /// rather than appending.
    pub async fn setup_tasks(&self) -> Result<(), SchedulerError> {
        let registry = self.inner.registry.lock().await;

        let mut catalogue = HashMap::with_capacity(registry.len());
        for factory in registry.iter() {
            let task = factory();
            let name = task.name().to_string();

            let configured = self.inner.frequencies.task_frequency(&name);
            let frequency =
                resolve_frequency(&name, configured.as_deref(), task.default_frequency());

            self.inner.store.ensure_task(&name).await?;
            debug!(
                task = %name,
                periodic = task.periodic(),
                frequency = ?frequency,
                "catalogued task"
            );
            catalogue.insert(name, CatalogueEntry { task, frequency });
        }

        info!(count = catalogue.len(), "task catalogue ready");
        *self.inner.catalogue.write().await = catalogue;
        Ok(())
    }

    /// Names of all catalogued tasks, sorted.
    pub async fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.catalogue.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a run of `name` is in flight. `None` for unknown tasks.
    pub async fn is_task_running(&self, name: &str) -> Option<bool> {
        if !self.inner.catalogue.read().await.contains_key(name) {
            return None;
        }
        Some(self.inner.store.is_running(name).await)
    }

    /// When the last run attempt of `name` finished.
    pub async fn last_run(&self, name: &str) -> Option<DateTime<Utc>> {
        if !self.inner.catalogue.read().await.contains_key(name) {
            return None;
        }
        self.inner.store.last_run(name).await
    }

    /// When `name` will next be auto-run: `None` for unknown,
    /// non-periodic, or never-scheduled tasks, otherwise
    /// `max(last_run + frequency, now)`.
    pub async fn next_run(&self, name: &str) -> Option<DateTime<Utc>> {
        let frequency = {
            let catalogue = self.inner.catalogue.read().await;
            let entry = catalogue.get(name)?;
            if !entry.task.periodic() {
                return None;
            }
            entry.frequency?
        };

        let now = Utc::now();
        let base = self.inner.store.last_run(name).await.unwrap_or(now);
        Some((base + frequency.as_duration()).max(now))
    }

    /// Whether the loops are currently running.
    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Spawn the periodic and queue loops. No-op when already running.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            debug!("scheduler already running");
            return;
        }

        info!("scheduler starting");
        self.inner.shutdown.send_replace(false);

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.scheduler_worker().await });

        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.queue_worker().await });
    }

    /// Ask the loops to stop at their next iteration boundary. Cooperative:
    /// a loop mid-sleep wakes immediately, but in-flight task invocations
    /// are never interrupted.
    pub fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("scheduler stopping");
        self.inner.shutdown.send_replace(true);
    }

    /// Run a task now, respecting the single-flight gate.
    ///
    /// Failures inside `prepare`/`run` are logged and reported as
    /// [`RunOutcome::Failed`]; they never propagate. Finalization
    /// (`post_run`, running-flag reset, last-run stamp, flush) happens for
    /// every outcome except a skip.
    #[tracing::instrument(skip(self, args))]
    pub async fn run_task(&self, name: &str, args: TaskArgs) -> Result<RunOutcome, SchedulerError> {
        let task = {
            let catalogue = self.inner.catalogue.read().await;
            catalogue.get(name).map(|entry| Arc::clone(&entry.task))
        }
        .ok_or_else(|| SchedulerError::UnknownTask(name.to_string()))?;

        match self.inner.store.begin_run(name).await? {
            RunGate::AlreadyRunning => {
                debug!("not running task, already in flight");
                return Ok(RunOutcome::Skipped);
            }
            RunGate::Started => {}
        }

        debug!("running task");
        let body = async {
            task.prepare(args).await?;
            task.run().await
        }
        .await;

        let outcome = match body {
            Ok(()) => RunOutcome::Completed,
            Err(e) => {
                error!(error = %e, "task failed");
                RunOutcome::Failed
            }
        };

        // Finalization: runs for every outcome above.
        let mut data = match self.inner.store.task_data(name).await {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "failed to load task data for post_run");
                TaskData::new()
            }
        };
        if let Err(e) = task.post_run(&mut data).await {
            error!(error = %e, "post_run failed");
        }
        if let Err(e) = self.inner.store.finish_run(name, data).await {
            error!(error = %e, "failed to persist run completion");
        }
        if let Some(hook) = &self.inner.housekeeping {
            hook();
        }

        Ok(outcome)
    }

    /// Enqueue an ad-hoc invocation. By convention the first positional
    /// argument is the target task name; the queue loop interprets it.
    /// Fire-and-forget: FIFO append, no deduplication.
    pub async fn dispatch(&self, entry: TaskArgs) -> Result<(), SchedulerError> {
        debug!(args = ?entry.args, "queueing ad-hoc invocation");
        self.inner.store.push_queue(entry).await?;
        Ok(())
    }

    /// Broadcast `name` to every currently-running periodic task.
    /// Best-effort: outcomes are logged, never surfaced to the caller.
    pub async fn signal(&self, name: &str, args: &TaskArgs) {
        let catalogue = self.inner.catalogue.read().await;
        for (task_name, entry) in catalogue.iter() {
            if !entry.task.periodic() {
                continue;
            }
            if !self.inner.store.is_running(task_name).await {
                debug!(signal = name, task = %task_name, "not signalling, task not running");
                continue;
            }

            debug!(signal = name, task = %task_name, "sending signal");
            match entry.task.signal(name, args).await {
                SignalOutcome::Accepted => {
                    debug!(signal = name, task = %task_name, "signal accepted")
                }
                SignalOutcome::Declined => {
                    debug!(signal = name, task = %task_name, "signal declined")
                }
                SignalOutcome::Unsupported => {
                    debug!(signal = name, task = %task_name, "signal unsupported")
                }
            }
        }
    }

    /// Drain the persisted queue and spawn one run per entry.
    async fn queue_worker(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        debug!("queue worker started");

        if !self.idle(&mut shutdown, self.inner.config.startup_delay).await {
            debug!("queue worker stopped");
            return;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.inner.store.drain_queue().await {
                Ok(entries) => {
                    for entry in entries {
                        let Some(name) = entry.first_str().map(str::to_string) else {
                            error!(args = ?entry.args, "queue entry has no task name, dropping");
                            continue;
                        };

                        debug!(task = %name, "dispatching queued task");
                        let scheduler = self.clone();
                        let args = entry.tail();
                        tokio::spawn(async move {
                            if let Err(e) = scheduler.run_task(&name, args).await {
                                error!(task = %name, error = %e, "queued task failed to start");
                            }
                        });

                        if !self.idle(&mut shutdown, self.inner.config.spawn_delay).await {
                            break;
                        }
                    }
                }
                Err(e) => error!(error = %e, "failed to drain queue"),
            }

            if !self.idle(&mut shutdown, self.inner.config.poll_interval).await {
                break;
            }
        }

        debug!("queue worker stopped");
    }

    /// Fire periodic tasks as they come due.
    async fn scheduler_worker(&self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        debug!("scheduler worker started");

        if !self.idle(&mut shutdown, self.inner.config.startup_delay).await {
            debug!("scheduler worker stopped");
            return;
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            let periodic: Vec<(String, Frequency)> = {
                let catalogue = self.inner.catalogue.read().await;
                catalogue
                    .iter()
                    .filter(|(_, entry)| entry.task.periodic())
                    .filter_map(|(name, entry)| entry.frequency.map(|f| (name.clone(), f)))
                    .collect()
            };

            for (name, frequency) in periodic {
                if *shutdown.borrow() {
                    break;
                }
                if self.inner.store.is_running(&name).await {
                    continue;
                }

                let due = match self.inner.store.last_run(&name).await {
                    None => true,
                    Some(last) => last + frequency.as_duration() <= Utc::now(),
                };
                if !due {
                    continue;
                }

                let spawn_name = self.migration_target(&name).await;
                debug!(task = %spawn_name, "periodic task due");
                let scheduler = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = scheduler.run_task(&spawn_name, TaskArgs::new()).await {
                        error!(task = %spawn_name, error = %e, "periodic task failed to start");
                    }
                });

                if !self.idle(&mut shutdown, self.inner.config.spawn_delay).await {
                    break;
                }
            }

            if !self.idle(&mut shutdown, self.inner.config.poll_interval).await {
                break;
            }
        }

        debug!("scheduler worker stopped");
    }

    /// Apply the one-time legacy substitution when `name` is the watched
    /// task and the migration has not fired yet. Returns the name to run.
    async fn migration_target(&self, name: &str) -> String {
        let Some(rule) = &self.inner.migration else {
            return name.to_string();
        };
        if rule.task != name || self.inner.store.migration_applied(&rule.key).await {
            return name.to_string();
        }
        if !self.inner.catalogue.read().await.contains_key(&rule.legacy) {
            error!(
                task = %rule.task,
                legacy = %rule.legacy,
                "legacy task not catalogued, skipping migration"
            );
            return name.to_string();
        }

        let recorded = async {
            self.inner.store.reset_last_run(&rule.legacy).await?;
            self.inner.store.mark_migration(&rule.key).await
        }
        .await;

        match recorded {
            Ok(()) => {
                info!(
                    task = %rule.task,
                    legacy = %rule.legacy,
                    "running legacy task once before cutover"
                );
                rule.legacy.clone()
            }
            Err(e) => {
                // substitution retries next time the watched task is due
                error!(error = %e, "failed to record migration, running current task");
                name.to_string()
            }
        }
    }

    /// Sleep for `duration`, waking early on shutdown. Returns false when
    /// the loop should exit.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => match changed {
                Ok(()) => !*shutdown.borrow(),
                Err(_) => false,
            },
            _ = sleep(duration) => true,
        }
    }
}

/// Resolve a task's effective cadence. A well-formed configured string
/// wins; a malformed one is logged and ignored in favor of the built-in
/// default. An explicit `"never"` is respected.
fn resolve_frequency(
    name: &str,
    configured: Option<&str>,
    default: Option<&str>,
) -> Option<Frequency> {
    if let Some(s) = configured {
        match Frequency::parse(s) {
            Ok(frequency) => return frequency,
            Err(e) => {
                warn!(task = name, error = %e, "ignoring invalid configured frequency")
            }
        }
    }
    if let Some(s) = default {
        match Frequency::parse(s) {
            Ok(frequency) => return frequency,
            Err(e) => warn!(task = name, error = %e, "invalid built-in frequency"),
        }
    }
    None
}
