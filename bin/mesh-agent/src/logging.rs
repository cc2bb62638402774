//! Process-wide tracing setup

use crate::config::LogConfig;
use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// Debug mode logs everything to stdout. Release mode appends JSON lines to
/// the configured file at the configured level. `RUST_LOG` wins when set.
pub fn init(config: &LogConfig) -> Result<()> {
    if config.release {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.file)
            .with_context(|| format!("Failed to open log file {}", config.file.display()))?;

        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter(&config.level))
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .try_init()
            .map_err(|e| anyhow!(e))
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter("trace"))
            .try_init()
            .map_err(|e| anyhow!(e))
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
