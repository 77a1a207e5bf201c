//! Configuration management for forkline
//!
//! This module handles loading and validating configuration from environment
//! variables and TOML files. The master hands its resolved configuration to
//! worker processes as JSON in [`WORKER_CONFIG_ENV`], so both roles always
//! agree on limits and timeouts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Set on worker processes; its presence selects the worker role
pub const WORKER_ID_ENV: &str = "FORKLINE_WORKER_ID";

/// Restart epoch the worker was forked in
pub const WORKER_EPOCH_ENV: &str = "FORKLINE_WORKER_EPOCH";

/// Resolved master configuration, JSON encoded
pub const WORKER_CONFIG_ENV: &str = "FORKLINE_WORKER_CONFIG";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Master / pool configuration
    pub supervisor: SupervisorConfig,

    /// Per-worker configuration
    pub worker: WorkerConfig,

    /// Cron tick configuration
    pub scheduler: SchedulerConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// How workers are isolated from the master
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// One OS process per worker
    #[default]
    Process,

    /// One tokio task per worker inside the master
    Task,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process => write!(f, "process"),
            Self::Task => write!(f, "task"),
        }
    }
}

impl FromStr for Isolation {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "task" => Ok(Self::Task),
            other => anyhow::bail!("unknown isolation mode: {other}"),
        }
    }
}

/// Supervisor-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Target pool size
    pub worker_num: usize,

    /// Run directory holding the master pid file
    pub run_dir: PathBuf,

    /// Time a draining worker gets before it is killed
    pub drain_timeout_secs: u64,

    /// Extra time on top of the drain timeout before the kill is sent,
    /// so a worker that gives up at exactly the timeout can exit on its own
    pub kill_grace_ms: u64,

    /// Worker isolation mode
    pub isolation: Isolation,

    /// First delay before reforking after an unexpected exit
    pub restart_backoff_base_ms: u64,

    /// Upper bound on the refork delay
    pub restart_backoff_max_ms: u64,

    /// Consecutive unexpected exits tolerated before the master gives up
    pub max_consecutive_failures: u32,
}

/// Worker-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Shared listening endpoint
    pub listen_addr: SocketAddr,

    /// Request count after which the worker asks to be replaced
    pub request_limit: u64,

    /// Heartbeat period
    pub heartbeat_interval_secs: u64,

    /// Time allowed for in-flight work after `Stop`
    pub drain_timeout_secs: u64,
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of both the maintenance and the dispatch tick
    pub tick_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

fn default_worker_num() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let isolation = match std::env::var("FORKLINE_ISOLATION") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.supervisor.isolation,
        };

        let listen_addr = match std::env::var("FORKLINE_LISTEN_ADDR") {
            Ok(value) => value
                .parse()
                .with_context(|| format!("Invalid FORKLINE_LISTEN_ADDR: {value}"))?,
            Err(_) => defaults.worker.listen_addr,
        };

        let drain_timeout_secs =
            env_parse("FORKLINE_DRAIN_TIMEOUT").unwrap_or(defaults.supervisor.drain_timeout_secs);

        Ok(Self {
            supervisor: SupervisorConfig {
                worker_num: env_parse("FORKLINE_WORKER_NUM").unwrap_or(defaults.supervisor.worker_num),
                run_dir: std::env::var("FORKLINE_RUN_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.supervisor.run_dir),
                drain_timeout_secs,
                kill_grace_ms: env_parse("FORKLINE_KILL_GRACE_MS")
                    .unwrap_or(defaults.supervisor.kill_grace_ms),
                isolation,
                restart_backoff_base_ms: env_parse("FORKLINE_RESTART_BACKOFF_BASE_MS")
                    .unwrap_or(defaults.supervisor.restart_backoff_base_ms),
                restart_backoff_max_ms: env_parse("FORKLINE_RESTART_BACKOFF_MAX_MS")
                    .unwrap_or(defaults.supervisor.restart_backoff_max_ms),
                max_consecutive_failures: env_parse("FORKLINE_MAX_CONSECUTIVE_FAILURES")
                    .unwrap_or(defaults.supervisor.max_consecutive_failures),
            },
            worker: WorkerConfig {
                listen_addr,
                request_limit: env_parse("FORKLINE_REQUEST_LIMIT")
                    .unwrap_or(defaults.worker.request_limit),
                heartbeat_interval_secs: env_parse("FORKLINE_HEARTBEAT_INTERVAL")
                    .unwrap_or(defaults.worker.heartbeat_interval_secs),
                drain_timeout_secs,
            },
            scheduler: SchedulerConfig {
                tick_interval_ms: env_parse("FORKLINE_TICK_INTERVAL_MS")
                    .unwrap_or(defaults.scheduler.tick_interval_ms),
            },
            logging: LoggingConfig {
                level: std::env::var("FORKLINE_LOG_LEVEL").unwrap_or(defaults.logging.level),
                format: std::env::var("FORKLINE_LOG_FORMAT").unwrap_or(defaults.logging.format),
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the configuration a master passed to this worker process
    pub fn from_worker_env() -> Result<Self> {
        let raw = std::env::var(WORKER_CONFIG_ENV)
            .with_context(|| format!("{WORKER_CONFIG_ENV} is not set"))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid {WORKER_CONFIG_ENV}"))
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.supervisor.worker_num == 0 {
            anyhow::bail!("worker_num must be greater than 0");
        }

        if self.supervisor.drain_timeout_secs == 0 || self.worker.drain_timeout_secs == 0 {
            anyhow::bail!("drain_timeout_secs must be greater than 0");
        }

        if self.supervisor.restart_backoff_base_ms > self.supervisor.restart_backoff_max_ms {
            anyhow::bail!("restart_backoff_base_ms must not exceed restart_backoff_max_ms");
        }

        if self.supervisor.max_consecutive_failures == 0 {
            anyhow::bail!("max_consecutive_failures must be greater than 0");
        }

        if self.worker.request_limit == 0 {
            anyhow::bail!("request_limit must be greater than 0");
        }

        if self.worker.heartbeat_interval_secs == 0 {
            anyhow::bail!("heartbeat_interval_secs must be greater than 0");
        }

        if self.scheduler.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be greater than 0");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("log format must be 'text' or 'json', got '{}'", self.logging.format);
        }

        Ok(())
    }
}

impl SupervisorConfig {
    /// Drain timeout as Duration
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Delay between `Stop` and the forced kill
    #[must_use]
    pub fn kill_after(&self) -> Duration {
        self.drain_timeout() + Duration::from_millis(self.kill_grace_ms)
    }
}

impl WorkerConfig {
    /// Drain timeout as Duration
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Heartbeat period as Duration
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl SchedulerConfig {
    /// Tick period as Duration
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_num: default_worker_num(),
            run_dir: PathBuf::from("run"),
            drain_timeout_secs: 15,
            kill_grace_ms: 500,
            isolation: Isolation::Process,
            restart_backoff_base_ms: 250,
            restart_backoff_max_ms: 30_000,
            max_consecutive_failures: 10,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7700)),
            request_limit: 10_000,
            heartbeat_interval_secs: 5,
            drain_timeout_secs: 15,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}
