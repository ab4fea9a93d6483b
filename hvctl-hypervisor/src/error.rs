//! Error types for the hypervisor layer and the lifecycle workflows.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a hypervisor backend.
#[derive(Error, Debug)]
pub enum HypervisorError {
    /// Failed to connect to the hypervisor.
    #[error("Failed to connect to hypervisor: {0}")]
    ConnectionFailed(String),

    /// Domain handle no longer resolves.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// The hypervisor rejected a request.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// XML generation/parsing error.
    #[error("XML error: {0}")]
    XmlError(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors from the disk provisioner.
#[derive(Error, Debug)]
pub enum DiskError {
    /// Refusing to overwrite an existing image.
    #[error("Disk image already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// Path lies outside the managed image directory.
    #[error("Path is outside the managed image directory: {}", .0.display())]
    NotManaged(PathBuf),

    /// Requested size is not positive.
    #[error("Invalid disk size: {0} GiB")]
    InvalidSize(u64),

    /// The image tool binary could not be found.
    #[error("Image tool '{0}' is not available")]
    ToolUnavailable(String),

    /// The image tool ran but exited unsuccessfully.
    #[error("Image tool failed (exit code {}): {stderr}", display_exit_code(.exit_code))]
    ToolFailed {
        /// Exit code, `None` when terminated by a signal
        exit_code: Option<i32>,
        /// Captured standard error
        stderr: String,
    },

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by lifecycle and inventory operations.
///
/// Every variant maps to a stable [`kind`](LifecycleError::kind) so front ends
/// can report the failure category alongside the message.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("Invalid VM specification: {0}")]
    InvalidSpec(String),

    #[error("Media not found or unreadable: {}", .0.display())]
    MediaNotFound(PathBuf),

    #[error("A domain named '{0}' is already defined")]
    AlreadyDefined(String),

    #[error("Network '{network}' is unavailable: {reason}")]
    NetworkUnavailable { network: String, reason: String },

    #[error("Disk provisioning failed: {0}")]
    Disk(#[from] DiskError),

    #[error("Failed to register VM '{name}': {reason}")]
    RegistrationFailed { name: String, reason: String },

    #[error("VM '{0}' not found")]
    NotFound(String),

    #[error("Failed to start VM '{name}': {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Failed to stop VM '{name}': {reason}")]
    StopFailed { name: String, reason: String },

    #[error("Failed to force stop VM '{name}': {reason}")]
    ForceStopFailed { name: String, reason: String },

    #[error("Failed to restart VM '{name}': {reason}")]
    RestartFailed { name: String, reason: String },

    #[error("Failed to undefine VM '{name}': {reason}")]
    UndefineFailed { name: String, reason: String },

    #[error("VM '{0}' is not running")]
    NotRunning(String),

    #[error("Console unavailable for VM '{name}': {reason}")]
    ConsoleUnavailable { name: String, reason: String },

    #[error("Failed to query VM '{name}': {reason}")]
    QueryFailed { name: String, reason: String },

    #[error("Inventory unavailable: {0}")]
    InventoryUnavailable(String),

    #[error("Hypervisor connection error: {0}")]
    Connection(String),
}

impl LifecycleError {
    /// Stable snake_case name of the failure category.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::InvalidSpec(_) => "invalid_spec",
            LifecycleError::MediaNotFound(_) => "media_not_found",
            LifecycleError::AlreadyDefined(_) => "already_defined",
            LifecycleError::NetworkUnavailable { .. } => "network_unavailable",
            LifecycleError::Disk(e) => match e {
                DiskError::AlreadyExists(_) => "disk_already_exists",
                DiskError::NotManaged(_) => "disk_not_managed",
                DiskError::InvalidSize(_) => "invalid_spec",
                DiskError::ToolUnavailable(_) => "tool_unavailable",
                DiskError::ToolFailed { .. } => "tool_failed",
                DiskError::Io(_) => "io_error",
            },
            LifecycleError::RegistrationFailed { .. } => "registration_failed",
            LifecycleError::NotFound(_) => "not_found",
            LifecycleError::StartFailed { .. } => "start_failed",
            LifecycleError::StopFailed { .. } => "stop_failed",
            LifecycleError::ForceStopFailed { .. } => "force_stop_failed",
            LifecycleError::RestartFailed { .. } => "restart_failed",
            LifecycleError::UndefineFailed { .. } => "undefine_failed",
            LifecycleError::NotRunning(_) => "not_running",
            LifecycleError::ConsoleUnavailable { .. } => "console_unavailable",
            LifecycleError::QueryFailed { .. } => "query_failed",
            LifecycleError::InventoryUnavailable(_) => "inventory_unavailable",
            LifecycleError::Connection(_) => "connection_error",
        }
    }
}

fn display_exit_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
}

/// Result type alias for hypervisor backend operations.
pub type Result<T> = std::result::Result<T, HypervisorError>;
