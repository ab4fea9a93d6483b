//! # hvctl Hypervisor
//!
//! VM lifecycle core for a single libvirt host.
//!
//! A high-level VM request (name, memory, vCPUs, disk size, install and
//! driver media) becomes a managed disk image plus a registered libvirt
//! domain, and is then driven through start, stop, force stop, restart and
//! delete.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Lifecycle                 │
//! │ (create, start, stop, delete, console)  │
//! └───────┬─────────────┬─────────────┬─────┘
//!         ▼             ▼             ▼
//! ┌──────────────┐ ┌───────────┐ ┌────────────────┐
//! │ DiskProvision│ │ Descriptor│ │ Hypervisor     │
//! │ (qemu-img)   │ │ Builder   │ │ trait          │
//! └──────────────┘ └───────────┘ └───────┬────────┘
//!                                ┌───────┴────────┐
//!                                ▼                ▼
//!                        ┌──────────────┐ ┌─────────────┐
//!                        │LibvirtBackend│ │ MockBackend │
//!                        └──────────────┘ └─────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hvctl_hypervisor::{DiskProvisioner, Lifecycle, MockBackend, VmSpec};
//!
//! #[tokio::main]
//! async fn main() {
//!     let lifecycle = Lifecycle::new(Arc::new(MockBackend::new()), DiskProvisioner::with_defaults());
//!
//!     let spec = VmSpec::new("win10", "/isos/win10.iso", "/isos/virtio-win.iso")
//!         .with_memory(4096)
//!         .with_vcpus(4);
//!
//!     lifecycle.create(&spec).await.unwrap();
//!     lifecycle.start("win10").await.unwrap();
//! }
//! ```

pub mod descriptor;
pub mod disk;
pub mod error;
pub mod inventory;
pub mod libvirt;
pub mod lifecycle;
pub mod locks;
pub mod mock;
pub mod traits;
pub mod types;

pub use descriptor::{DescriptorBuilder, DomainDescriptor, DomainDocument, DEFAULT_NETWORK};
pub use disk::{DiskProvisioner, ImageTool, QemuImg, ToolOutput, DEFAULT_IMAGE_DIR};
pub use error::{DiskError, HypervisorError, LifecycleError};
pub use inventory::list_domains;
pub use lifecycle::Lifecycle;
pub use locks::NameLocks;
pub use mock::{MockBackend, MockOp};
pub use traits::Hypervisor;
pub use types::*;

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::LibvirtBackend;
