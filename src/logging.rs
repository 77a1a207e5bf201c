//! Tracing subscriber setup
//!
//! Both roles log to stderr. A worker process's stdout carries the IPC
//! stream, so nothing else may ever write to it.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins, then `--verbose`, then the configured level
fn env_filter(level: &str, verbose: bool) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    if verbose {
        EnvFilter::new("forkline=debug,info")
    } else {
        EnvFilter::new(format!("forkline={level},warn"))
    }
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn setup_tracing(config: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = env_filter(&config.level, verbose);

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .try_init()?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()?;
        }
    }

    Ok(())
}

/// Span wrapping everything a worker does
pub fn worker_span(id: u64, epoch: u64) -> tracing::Span {
    tracing::info_span!("worker", id, epoch)
}
