//! Command-line argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hvctl_hypervisor::{DEFAULT_DISK_GIB, DEFAULT_MEMORY_MIB, DEFAULT_VCPUS};

/// hvctl - VM lifecycle management for a single libvirt host
#[derive(Parser, Debug)]
#[command(name = "hvctl")]
#[command(about = "hvctl - VM lifecycle management for a single libvirt host")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Libvirt connection URI
    #[arg(long, global = true, env = "HVCTL_LIBVIRT_URI")]
    pub libvirt_uri: Option<String>,

    /// Directory holding managed disk images
    #[arg(long, global = true)]
    pub image_dir: Option<PathBuf>,

    /// Enable development mode (mock hypervisor)
    #[arg(long, global = true)]
    pub dev: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List running and stopped VMs
    List,

    /// Create a VM with a new disk (does not start it)
    Create {
        /// VM name (letters, numbers, '_' and '-')
        name: String,

        /// Installation ISO
        #[arg(long)]
        iso: PathBuf,

        /// Driver ISO attached as a second cdrom
        #[arg(long)]
        drivers: PathBuf,

        /// Memory in MiB
        #[arg(long, default_value_t = DEFAULT_MEMORY_MIB)]
        memory: u64,

        /// Number of virtual CPUs
        #[arg(long, default_value_t = DEFAULT_VCPUS)]
        vcpus: u32,

        /// Disk size in GiB
        #[arg(long, default_value_t = DEFAULT_DISK_GIB)]
        disk: u64,
    },

    /// Start a VM
    Start { name: String },

    /// Ask a VM to shut down
    Stop { name: String },

    /// Power a VM off immediately
    ForceStop { name: String },

    /// Reboot a running VM, or start a stopped one
    Restart { name: String },

    /// Delete a VM and its managed disk
    Delete { name: String },

    /// Show the VNC endpoint of a running VM
    Console { name: String },

    /// Show VM configuration and state
    Info { name: String },
}
