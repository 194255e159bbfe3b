//! Command-line interface support.
//!
//! This module provides logging options shared by the worker binary and the
//! subscriber setup that consumes them.

use clap::Args;
use serde::Deserialize;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Logging configuration that can be set via CLI or env vars
#[derive(Debug, Clone, Default, Args, Deserialize)]
pub struct LoggingConfig {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    #[serde(skip)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "MEDGEMMA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log filter directives
    #[arg(long = "log-filter", env = "MEDGEMMA_LOG_FILTER")]
    pub log_filter: Option<String>,
}

impl LoggingConfig {
    pub fn get_effective_level(&self) -> &str {
        match (self.verbose, self.log_level.as_deref()) {
            (v, _) if v >= 2 => "trace", // -vv flag
            (1, _) => "debug",           // -v flag
            (0, Some(level)) => level,   // Configured level
            _ => "info",                 // Default
        }
    }

    /// Build the env filter for the fmt subscriber.
    pub fn env_filter(&self) -> EnvFilter {
        let level: Level = self.get_effective_level().parse().unwrap_or(Level::INFO);
        EnvFilter::builder()
            .with_default_directive(level.into())
            .parse_lossy(self.log_filter.as_deref().unwrap_or(""))
    }

    /// Install the global tracing subscriber.
    pub fn init(&self) {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter())
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}
