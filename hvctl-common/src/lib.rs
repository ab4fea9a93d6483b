//! # hvctl Common
//!
//! Shared utilities for the hvctl crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use hvctl_common::init_logging;
//!
//! init_logging("info").unwrap();
//! tracing::info!(vm = "win10", "VM created");
//! ```

pub mod logging;

// Re-export logging functions
pub use logging::{init_logging, init_logging_json, is_valid_level, LOG_LEVELS};
