//! Logging initialization using tracing.
//!
//! Log lines go to stderr so that command output on stdout stays clean.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Accepted log level names.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// True if `level` is one of [`LOG_LEVELS`] (case-insensitive).
pub fn is_valid_level(level: &str) -> bool {
    LOG_LEVELS.iter().any(|l| l.eq_ignore_ascii_case(level))
}

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when set.
///
/// # Arguments
/// * `level` - Log level string (trace, debug, info, warn, error)
pub fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {}", e))
}

/// Initialize logging with JSON output format.
/// Suitable for hosts that ship logs to an aggregator.
pub fn init_logging_json(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to initialise logging: {}", e))
}
