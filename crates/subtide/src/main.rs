//! subtide: background task scheduling daemon.
//!
//! Main binary with subcommands:
//! - `daemon`: run the scheduling loops until interrupted
//! - `dispatch`: queue an ad-hoc task invocation
//! - `tasks`: list catalogued tasks with their cadences
//! - `clear-data`: reset persisted task data

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;
mod tasks;

use daemon::DaemonConfig;

#[derive(Parser)]
#[command(name = "subtide")]
#[command(about = "Background task scheduling daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduling daemon
    Daemon {
        /// Directory holding the persistent task store
        #[arg(long, env = "SUBTIDE_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Cache directory swept by the cache-cleanup task
        #[arg(long, env = "SUBTIDE_CACHE_DIR")]
        cache_dir: Option<PathBuf>,

        /// Age in days after which cache files are pruned
        #[arg(long, default_value = "14")]
        cache_max_age_days: u32,

        /// Number of store backups to keep
        #[arg(long, default_value = "5")]
        backup_keep: usize,

        /// Delay in seconds before the loops start polling
        #[arg(long, default_value = "10")]
        startup_delay: u64,

        /// Sleep in seconds between loop passes
        #[arg(long, default_value = "1")]
        poll_interval: u64,

        /// Sleep in seconds between consecutive task spawns
        #[arg(long, default_value = "5")]
        spawn_delay: u64,
    },

    /// Queue an ad-hoc task invocation
    Dispatch {
        /// Directory holding the persistent task store
        #[arg(long, env = "SUBTIDE_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Target task name
        task: String,

        /// Positional arguments forwarded to the task (JSON values or
        /// plain strings)
        args: Vec<String>,
    },

    /// List catalogued tasks with their cadences and run times
    Tasks {
        /// Directory holding the persistent task store
        #[arg(long, env = "SUBTIDE_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },

    /// Reset persisted task data
    ClearData {
        /// Directory holding the persistent task store
        #[arg(long, env = "SUBTIDE_DATA_DIR")]
        data_dir: Option<PathBuf>,

        /// Task to clear; clears every task and the queue when omitted
        task: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "subtide=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            data_dir,
            cache_dir,
            cache_max_age_days,
            backup_keep,
            startup_delay,
            poll_interval,
            spawn_delay,
        } => {
            let mut config = DaemonConfig::new(resolve_data_dir(data_dir), resolve_cache_dir(cache_dir));
            config.cache_max_age_days = cache_max_age_days;
            config.backup_keep = backup_keep;
            config.startup_delay = startup_delay;
            config.poll_interval = poll_interval;
            config.spawn_delay = spawn_delay;
            daemon::run(config).await
        }

        Commands::Dispatch {
            data_dir,
            task,
            args,
        } => daemon::dispatch(resolve_data_dir(data_dir), &task, args).await,

        Commands::Tasks { data_dir } => {
            let config = DaemonConfig::new(resolve_data_dir(data_dir), resolve_cache_dir(None));
            daemon::list_tasks(config).await
        }

        Commands::ClearData { data_dir, task } => {
            daemon::clear_data(resolve_data_dir(data_dir), task.as_deref()).await
        }
    }
}

fn resolve_data_dir(dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("subtide")
    })
}

fn resolve_cache_dir(dir: Option<PathBuf>) -> PathBuf {
    dir.unwrap_or_else(|| {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("subtide")
    })
}
