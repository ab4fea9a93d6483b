//! Type definitions for VM specifications, handles and reports.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// VM SPECIFICATION
// =============================================================================

/// Default guest memory in MiB.
pub const DEFAULT_MEMORY_MIB: u64 = 2048;
/// Default number of virtual CPUs.
pub const DEFAULT_VCPUS: u32 = 2;
/// Default disk size in GiB.
pub const DEFAULT_DISK_GIB: u64 = 20;
/// Largest guest memory accepted, 16 TiB.
pub const MAX_MEMORY_MIB: u64 = 16 * 1024 * 1024;

/// What the operator asked for when creating a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Domain name, unique on the host
    pub name: String,
    /// Installation ISO
    pub install_media: PathBuf,
    /// Paravirtual driver ISO
    pub driver_media: PathBuf,
    /// Memory size in MiB
    pub memory_mib: u64,
    /// Number of virtual CPUs
    pub vcpus: u32,
    /// Disk size in GiB
    pub disk_gib: u64,
}

impl VmSpec {
    /// Create a new VM spec with default sizing.
    pub fn new(
        name: impl Into<String>,
        install_media: impl Into<PathBuf>,
        driver_media: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            install_media: install_media.into(),
            driver_media: driver_media.into(),
            memory_mib: DEFAULT_MEMORY_MIB,
            vcpus: DEFAULT_VCPUS,
            disk_gib: DEFAULT_DISK_GIB,
        }
    }

    /// Set the memory size in MiB.
    pub fn with_memory(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    /// Set the number of vCPUs.
    pub fn with_vcpus(mut self, vcpus: u32) -> Self {
        self.vcpus = vcpus;
        self
    }

    /// Set the disk size in GiB.
    pub fn with_disk(mut self, disk_gib: u64) -> Self {
        self.disk_gib = disk_gib;
        self
    }

    /// Check the fields that can be checked without touching the host.
    ///
    /// Names are limited to letters, digits, `_` and `-` because the name
    /// becomes a file name inside the managed image directory.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("name must not be empty".to_string());
        }
        if !self.name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-') {
            return Err(format!(
                "name '{}' may only contain letters, numbers, underscores and hyphens",
                self.name
            ));
        }
        if self.memory_mib == 0 {
            return Err("memory must be greater than 0".to_string());
        }
        if self.memory_mib > MAX_MEMORY_MIB {
            return Err(format!(
                "memory {} MiB exceeds the maximum of {} MiB",
                self.memory_mib, MAX_MEMORY_MIB
            ));
        }
        if self.vcpus == 0 {
            return Err("vcpus must be greater than 0".to_string());
        }
        if self.disk_gib == 0 {
            return Err("disk size must be greater than 0".to_string());
        }
        Ok(())
    }
}

// =============================================================================
// STORAGE
// =============================================================================

/// Disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
}

impl DiskFormat {
    /// Format name as understood by qemu-img and libvirt.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }

    /// File extension for images of this format.
    pub fn extension(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "img",
        }
    }
}

/// A backing disk created by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedDisk {
    /// Image path under the managed directory
    pub path: PathBuf,
    /// Virtual size in GiB
    pub size_gib: u64,
}

// =============================================================================
// DOMAIN HANDLES AND REPORTS
// =============================================================================

/// Reference to a domain registered with the hypervisor.
///
/// Handles are resolved per operation and never kept across operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRef {
    /// Domain name
    pub name: String,
    /// Domain UUID
    pub uuid: String,
}

/// A running domain as seen by the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDomain {
    /// Host-assigned runtime ID
    pub id: u32,
    /// Domain name
    pub name: String,
}

/// A defined but inactive domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InactiveDomain {
    /// Domain name
    pub name: String,
}

/// All domains on the host, in the order the hypervisor reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub active: Vec<ActiveDomain>,
    pub inactive: Vec<InactiveDomain>,
}

impl Inventory {
    /// Total number of domains.
    pub fn len(&self) -> usize {
        self.active.len() + self.inactive.len()
    }

    /// True when no domains exist.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Detailed view of a single domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainDetails {
    pub name: String,
    pub uuid: String,
    pub running: bool,
    pub memory_mib: u64,
    pub vcpus: u32,
    pub arch: Option<String>,
    pub autostart: bool,
    pub disk_path: Option<PathBuf>,
    pub vnc_port: Option<u16>,
}

/// Console connection information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleInfo {
    /// Host to connect to
    pub host: String,
    /// VNC port
    pub port: u16,
}

/// What `delete` did beyond undefining the domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    /// Managed disk that was removed
    pub disk_removed: Option<PathBuf>,
    /// Disk left in place (outside the managed directory, or removal failed)
    pub disk_retained: Option<PathBuf>,
    /// Error from the pre-delete force stop, if one was attempted and failed
    pub force_stop_error: Option<String>,
}

/// Returns true if `path` is a readable regular file.
pub(crate) fn is_readable_file(path: &Path) -> bool {
    path.is_file() && std::fs::File::open(path).is_ok()
}
