//! # hvctl
//!
//! Command-line front end for VM lifecycle management on a single libvirt
//! host. Each invocation connects once, runs one command and exits.
//!
//! ## Usage
//! ```bash
//! hvctl create win10 --iso /isos/win10.iso --drivers /isos/virtio-win.iso --memory 4096
//! hvctl start win10
//! hvctl list
//! hvctl delete win10
//! ```
//!
//! Operation failures are reported as `Error [<kind>]: <message>` and still
//! exit with status 0. Only an invalid configuration or a failed hypervisor
//! connection exits non-zero.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use hvctl_hypervisor::{DiskProvisioner, Hypervisor, Lifecycle, LifecycleError, MockBackend, QemuImg};

mod cli;
mod commands;
mod config;

use cli::Args;
use config::{Config, HypervisorBackend};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so the file can set the level
    let config = Config::resolve(&args)?;

    if config.log_json {
        hvctl_common::init_logging_json(&config.log_level)?;
    } else {
        hvctl_common::init_logging(&config.log_level)?;
    }

    debug!(
        version = env!("CARGO_PKG_VERSION"),
        backend = ?config.hypervisor.backend,
        image_dir = %config.storage.image_dir.display(),
        network = %config.network,
        "hvctl configured"
    );

    let hypervisor = match connect(&config).await {
        Ok(hypervisor) => hypervisor,
        Err(e) => {
            error!(error = %e, "Failed to connect to hypervisor");
            return Err(e.into());
        }
    };

    let disks = DiskProvisioner::new(
        config.storage.image_dir.clone(),
        config.storage.image_format,
        Arc::new(QemuImg::with_binary(config.storage.qemu_img.as_str())),
    );
    let lifecycle = Lifecycle::new(hypervisor, disks).with_network(config.network.as_str());

    match commands::run(&lifecycle, &args.command, args.json).await {
        Ok(output) => println!("{}", output),
        Err(e) => {
            debug!(kind = e.kind(), error = %e, "Command failed");
            eprintln!("{}", commands::render_error(&e, args.json));
        }
    }

    Ok(())
}

/// Open the configured hypervisor backend.
async fn connect(config: &Config) -> std::result::Result<Arc<dyn Hypervisor>, LifecycleError> {
    info!(backend = ?config.hypervisor.backend, "Connecting to hypervisor");

    match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            warn!("Using mock hypervisor backend, state is not kept between runs");
            Ok(Arc::new(MockBackend::new()))
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                let uri = config.hypervisor.libvirt_uri.as_str();
                let backend = hvctl_hypervisor::LibvirtBackend::connect(uri)
                    .await
                    .map_err(|e| LifecycleError::Connection(e.to_string()))?;
                debug!(uri = %backend.uri(), "Hypervisor connection established");
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "libvirt"))]
            {
                Err(LifecycleError::Connection(
                    "libvirt backend requested but hvctl was built without the `libvirt` feature".to_string(),
                ))
            }
        }
    }
}
