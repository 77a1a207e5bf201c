use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forkline::cluster::{Cluster, Role};
use forkline::config::Config;
use forkline::logging::setup_tracing;
use forkline::scheduler::{FnJob, Job};
use forkline::supervisor::{notify_master, read_master_pid, ControlSignal};

/// Upper bound on waiting for blocking tasks once the cluster has stopped
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "forkline",
    version,
    about = "Pre-forking worker supervisor with rolling restarts and cron fan-out",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// TOML configuration file (defaults to FORKLINE_* environment variables)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the master and its workers
    Run {
        /// Number of workers (overrides the configuration)
        #[arg(short, long)]
        workers: Option<usize>,
    },

    /// Ask a running master for a rolling restart (SIGUSR2)
    Reload,

    /// Ask a running master to drain and exit (SIGTERM)
    Stop,
}

fn main() {
    let code = match try_main() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("forkline: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    match cli.command {
        Commands::Run { workers } => {
            if let Some(workers) = workers {
                config.supervisor.worker_num = workers;
            }
            config.validate()?;
            setup_tracing(&config.logging, cli.verbose)?;
            run(config)
        }
        Commands::Reload => {
            setup_tracing(&config.logging, cli.verbose)?;
            control(&config, ControlSignal::Reload)
        }
        Commands::Stop => {
            setup_tracing(&config.logging, cli.verbose)?;
            control(&config, ControlSignal::Stop)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    }
}

/// Start whichever role this process has
fn run(config: Config) -> Result<i32> {
    let role = Role::detect()?;

    // One scheduling context per worker; the master can use every core
    let runtime = if role.is_master() {
        tokio::runtime::Builder::new_multi_thread().enable_all().build()
    } else {
        tokio::runtime::Builder::new_current_thread().enable_all().build()
    }
    .context("Failed to build tokio runtime")?;

    if role.is_master() {
        tracing::info!(
            workers = config.supervisor.worker_num,
            isolation = %config.supervisor.isolation,
            "forkline starting"
        );
    }

    let code = runtime.block_on(Cluster::new(config, demo_jobs()).run());

    // A worker's stdin reader is stuck in a blocking read until the master
    // closes the pipe, and the master only does that once we have exited
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    Ok(code)
}

/// Signal the master recorded in the run directory
fn control(config: &Config, signal: ControlSignal) -> Result<i32> {
    let pid = read_master_pid(&config.supervisor.run_dir)?;
    notify_master(pid, signal)?;

    tracing::info!(pid, signal = ?signal, "Signal delivered");
    println!("Sent {signal:?} to master {pid}");
    Ok(0)
}

/// Jobs the demo cluster runs every second
fn demo_jobs() -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(FnJob::cron("fetch_video", "* * * * * *", || async {
            tracing::info!("Fetching video metadata");
            tokio::time::sleep(Duration::from_secs(3)).await;
            tracing::info!("Video metadata fetched");
            Ok(())
        })),
        Arc::new(FnJob::cron("notice_user", "* * * * * *", || async {
            tracing::info!("Sending user notices");
            tokio::time::sleep(Duration::from_secs(2)).await;
            tracing::info!("User notices sent");
            Ok(())
        })),
    ]
}
