//! VM lifecycle workflows.
//!
//! [`Lifecycle`] composes the hypervisor, the disk provisioner and the
//! descriptor builder into the operations the CLI exposes. Each workflow
//! resolves the domain by name at the start of the call and never keeps
//! handles around afterwards.
//!
//! Create is the only workflow with a compensating action: if the domain
//! cannot be registered, the freshly allocated disk is removed again.
//! Delete undefines first and only then removes the disk, and only when the
//! disk recorded in the hypervisor's descriptor is inside the managed
//! image directory.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::descriptor::{DescriptorBuilder, DomainDocument, DEFAULT_NETWORK};
use crate::disk::DiskProvisioner;
use crate::error::{HypervisorError, LifecycleError};
use crate::inventory;
use crate::locks::NameLocks;
use crate::traits::Hypervisor;
use crate::types::{
    is_readable_file, ConsoleInfo, DeleteOutcome, DomainDetails, DomainRef, Inventory, ManagedDisk,
    VmSpec,
};

/// Host reported for VNC consoles.
const CONSOLE_HOST: &str = "localhost";

/// VM lifecycle orchestrator.
pub struct Lifecycle {
    hypervisor: Arc<dyn Hypervisor>,
    disks: DiskProvisioner,
    network: String,
    locks: NameLocks,
}

impl Lifecycle {
    /// Create an orchestrator over a hypervisor connection and a disk provisioner.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, disks: DiskProvisioner) -> Self {
        Self {
            hypervisor,
            disks,
            network: DEFAULT_NETWORK.to_string(),
            locks: NameLocks::new(),
        }
    }

    /// Attach new VMs to a different libvirt network.
    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn disks(&self) -> &DiskProvisioner {
        &self.disks
    }

    // =========================================================================
    // Create
    // =========================================================================

    /// Provision a disk and register a new, stopped domain.
    ///
    /// Nothing on the host is touched until the VM spec, the media, the name
    /// and the network have all been checked. A registration failure removes
    /// the disk created for it.
    #[instrument(skip(self, spec), fields(vm = %spec.name))]
    pub async fn create(&self, spec: &VmSpec) -> Result<ManagedDisk, LifecycleError> {
        info!(
            memory_mib = spec.memory_mib,
            vcpus = spec.vcpus,
            disk_gib = spec.disk_gib,
            "Creating VM"
        );

        spec.validate().map_err(LifecycleError::InvalidSpec)?;
        for media in [&spec.install_media, &spec.driver_media] {
            if !is_readable_file(media) {
                return Err(LifecycleError::MediaNotFound(media.clone()));
            }
        }

        let _guard = self.locks.acquire(&spec.name).await;

        match self.hypervisor.lookup_by_name(&spec.name).await {
            Ok(Some(_)) => return Err(LifecycleError::AlreadyDefined(spec.name.clone())),
            Ok(None) => {}
            Err(e) => {
                return Err(LifecycleError::RegistrationFailed {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                })
            }
        }

        self.ensure_network().await?;

        let path = self.disks.managed_path(&spec.name);
        let disk = self.disks.create(&path, spec.disk_gib).await?;

        match self.register(spec, &disk.path).await {
            Ok(domain) => {
                info!(uuid = %domain.uuid, disk = %disk.path.display(), "VM created");
                Ok(disk)
            }
            Err(e) => {
                warn!(error = %e, "Registration failed, removing disk");
                self.rollback_disk(&disk.path);
                Err(LifecycleError::RegistrationFailed {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn register(&self, spec: &VmSpec, disk_path: &Path) -> Result<DomainRef, HypervisorError> {
        let xml = DescriptorBuilder::new(spec, disk_path)
            .with_format(self.disks.format())
            .with_network(self.network.as_str())
            .build()?
            .to_xml()?;

        debug!(xml = %xml, "Generated domain XML");

        self.hypervisor.define(&xml).await
    }

    fn rollback_disk(&self, path: &Path) {
        match self.disks.remove(path) {
            Ok(true) => info!(path = %path.display(), "Rolled back disk image"),
            Ok(false) => debug!(path = %path.display(), "No disk image to roll back"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to roll back disk image"),
        }
    }

    /// Make sure the configured network exists and is running.
    async fn ensure_network(&self) -> Result<(), LifecycleError> {
        let unavailable = |reason: String| LifecycleError::NetworkUnavailable {
            network: self.network.clone(),
            reason,
        };

        match self.hypervisor.network_active(&self.network).await {
            Ok(Some(true)) => Ok(()),
            Ok(Some(false)) => {
                info!(network = %self.network, "Starting inactive network");
                self.hypervisor
                    .start_network(&self.network)
                    .await
                    .map_err(|e| unavailable(e.to_string()))
            }
            Ok(None) => Err(unavailable("network is not defined".to_string())),
            Err(e) => Err(unavailable(e.to_string())),
        }
    }

    // =========================================================================
    // Power state
    // =========================================================================

    /// Boot a defined domain.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn start(&self, name: &str) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire(name).await;

        let failed = |reason: String| LifecycleError::StartFailed {
            name: name.to_string(),
            reason,
        };

        let domain = self
            .resolve(name)
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        self.hypervisor.start(&domain).await.map_err(|e| failed(e.to_string()))?;

        info!("VM started");
        Ok(())
    }

    /// Ask the guest to shut down. Returns once the request is accepted.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn stop(&self, name: &str) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire(name).await;

        let failed = |reason: String| LifecycleError::StopFailed {
            name: name.to_string(),
            reason,
        };

        let domain = self
            .resolve(name)
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| failed("domain not found".to_string()))?;

        self.hypervisor.shutdown(&domain).await.map_err(|e| failed(e.to_string()))?;

        info!("Shutdown requested");
        Ok(())
    }

    /// Power the domain off immediately.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn force_stop(&self, name: &str) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire(name).await;

        let failed = |reason: String| LifecycleError::ForceStopFailed {
            name: name.to_string(),
            reason,
        };

        let domain = self
            .resolve(name)
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| failed("domain not found".to_string()))?;

        self.hypervisor.destroy(&domain).await.map_err(|e| failed(e.to_string()))?;

        info!("VM force stopped");
        Ok(())
    }

    /// Reboot a running domain, or start a stopped one.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn restart(&self, name: &str) -> Result<(), LifecycleError> {
        let _guard = self.locks.acquire(name).await;

        let failed = |reason: String| LifecycleError::RestartFailed {
            name: name.to_string(),
            reason,
        };

        let domain = self
            .resolve(name)
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        let running = self.hypervisor.is_active(&domain).await.map_err(|e| failed(e.to_string()))?;
        if running {
            self.hypervisor.reboot(&domain).await.map_err(|e| failed(e.to_string()))?;
            info!("VM rebooted");
        } else {
            self.hypervisor.start(&domain).await.map_err(|e| failed(e.to_string()))?;
            info!("VM was stopped, started it");
        }
        Ok(())
    }

    // =========================================================================
    // Delete
    // =========================================================================

    /// Undefine a domain and remove its managed disk.
    ///
    /// A running domain is force stopped first; if that fails the error is
    /// recorded and the undefine is attempted anyway. The disk path comes
    /// from the hypervisor's descriptor, never from the name. Disks outside
    /// the managed directory are left alone.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn delete(&self, name: &str) -> Result<DeleteOutcome, LifecycleError> {
        let _guard = self.locks.acquire(name).await;

        info!("Deleting VM");

        let domain = self
            .resolve(name)
            .await
            .map_err(|e| LifecycleError::UndefineFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        let mut outcome = DeleteOutcome::default();

        let running = match self.hypervisor.is_active(&domain).await {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "Could not determine power state, attempting force stop");
                true
            }
        };
        if running {
            if let Err(e) = self.hypervisor.destroy(&domain).await {
                warn!(error = %e, "Force stop before delete failed, undefining anyway");
                outcome.force_stop_error = Some(e.to_string());
            }
        }

        let disk_path = match self.hypervisor.descriptor(&domain).await {
            Ok(xml) => match DomainDocument::from_xml(&xml) {
                Ok(doc) => doc.primary_disk_path(),
                Err(e) => {
                    warn!(error = %e, "Could not parse descriptor, no disk will be removed");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Could not fetch descriptor, no disk will be removed");
                None
            }
        };
        debug!(disk = ?disk_path, "Discovered disk");

        self.hypervisor
            .undefine(&domain)
            .await
            .map_err(|e| LifecycleError::UndefineFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        info!("VM undefined");

        if let Some(path) = disk_path {
            if !self.disks.is_managed(&path) {
                info!(path = %path.display(), "Disk is outside the managed directory, leaving it in place");
                outcome.disk_retained = Some(path);
            } else {
                match self.disks.remove(&path) {
                    Ok(true) => outcome.disk_removed = Some(path),
                    Ok(false) => debug!(path = %path.display(), "Disk image already absent"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to delete disk image");
                        outcome.disk_retained = Some(path);
                    }
                }
            }
        }

        Ok(outcome)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// VNC endpoint of a running domain.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn console(&self, name: &str) -> Result<ConsoleInfo, LifecycleError> {
        let unavailable = |reason: String| LifecycleError::ConsoleUnavailable {
            name: name.to_string(),
            reason,
        };

        let domain = self
            .resolve(name)
            .await
            .map_err(|e| unavailable(e.to_string()))?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        if !self.hypervisor.is_active(&domain).await.map_err(|e| unavailable(e.to_string()))? {
            return Err(LifecycleError::NotRunning(name.to_string()));
        }

        let xml = self.hypervisor.descriptor(&domain).await.map_err(|e| unavailable(e.to_string()))?;
        let doc = DomainDocument::from_xml(&xml).map_err(|e| unavailable(e.to_string()))?;

        if !doc.has_vnc() {
            return Err(unavailable("no VNC display configured".to_string()));
        }
        let port = doc
            .vnc_port()
            .ok_or_else(|| unavailable("VNC port not assigned".to_string()))?;

        Ok(ConsoleInfo {
            host: CONSOLE_HOST.to_string(),
            port,
        })
    }

    /// Configuration and state of one domain.
    #[instrument(skip(self), fields(vm = %name))]
    pub async fn details(&self, name: &str) -> Result<DomainDetails, LifecycleError> {
        let failed = |reason: String| LifecycleError::QueryFailed {
            name: name.to_string(),
            reason,
        };

        let domain = self
            .resolve(name)
            .await
            .map_err(|e| failed(e.to_string()))?
            .ok_or_else(|| LifecycleError::NotFound(name.to_string()))?;

        let running = self.hypervisor.is_active(&domain).await.map_err(|e| failed(e.to_string()))?;
        let autostart = self.hypervisor.autostart(&domain).await.map_err(|e| failed(e.to_string()))?;
        let xml = self.hypervisor.descriptor(&domain).await.map_err(|e| failed(e.to_string()))?;
        let doc = DomainDocument::from_xml(&xml).map_err(|e| failed(e.to_string()))?;

        Ok(DomainDetails {
            name: domain.name,
            uuid: domain.uuid,
            running,
            memory_mib: doc.memory_mib().unwrap_or_default(),
            vcpus: doc.vcpus().unwrap_or_default(),
            arch: doc.arch(),
            autostart,
            disk_path: doc.primary_disk_path(),
            vnc_port: doc.vnc_port(),
        })
    }

    /// All domains on the host.
    pub async fn list(&self) -> Result<Inventory, LifecycleError> {
        inventory::list_domains(self.hypervisor.as_ref()).await
    }

    async fn resolve(&self, name: &str) -> Result<Option<DomainRef>, HypervisorError> {
        self.hypervisor.lookup_by_name(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::{ImageTool, ToolOutput};
    use crate::mock::MockBackend;
    use crate::types::DiskFormat;
    use async_trait::async_trait;

    struct TouchTool;

    #[async_trait]
    impl ImageTool for TouchTool {
        fn name(&self) -> &str {
            "touch"
        }

        async fn create_image(&self, path: &Path, _format: DiskFormat, _size_gib: u64) -> std::io::Result<ToolOutput> {
            std::fs::write(path, b"")?;
            Ok(ToolOutput { exit_code: Some(0), ..Default::default() })
        }
    }

    fn lifecycle(backend: Arc<MockBackend>, dir: &Path) -> Lifecycle {
        let disks = DiskProvisioner::new(dir.join("images"), DiskFormat::Qcow2, Arc::new(TouchTool));
        Lifecycle::new(backend, disks)
    }

    fn media(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let iso = dir.join("install.iso");
        let drivers = dir.join("virtio.iso");
        std::fs::write(&iso, b"iso").unwrap();
        std::fs::write(&drivers, b"iso").unwrap();
        (iso, drivers)
    }

    #[tokio::test]
    async fn test_create_starts_inactive_network() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new().with_network("default", false));
        let lifecycle = lifecycle(backend.clone(), dir.path());
        let (iso, drivers) = media(dir.path());

        lifecycle.create(&VmSpec::new("vm1", iso, drivers)).await.unwrap();
        assert_eq!(backend.network_active("default").await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_create_fails_on_undefined_network() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let lifecycle = lifecycle(backend.clone(), dir.path()).with_network("lab");
        let (iso, drivers) = media(dir.path());

        let err = lifecycle.create(&VmSpec::new("vm1", iso, drivers)).await.unwrap_err();
        assert_eq!(err.kind(), "network_unavailable");
        assert_eq!(backend.domain_count(), 0);
        assert!(!lifecycle.disks().managed_path("vm1").exists());
    }

    #[tokio::test]
    async fn test_create_rejects_missing_media_before_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let lifecycle = lifecycle(backend.clone(), dir.path());
        let (iso, _) = media(dir.path());

        let spec = VmSpec::new("vm1", iso, dir.path().join("missing.iso"));
        let err = lifecycle.create(&spec).await.unwrap_err();
        assert!(matches!(err, LifecycleError::MediaNotFound(_)));
        assert_eq!(backend.mutation_count(), 0);
        assert!(!lifecycle.disks().image_dir().exists());
    }

    #[tokio::test]
    async fn test_restart_starts_stopped_vm() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let lifecycle = lifecycle(backend.clone(), dir.path());
        let (iso, drivers) = media(dir.path());
        lifecycle.create(&VmSpec::new("vm1", iso, drivers)).await.unwrap();

        lifecycle.restart("vm1").await.unwrap();
        assert!(lifecycle.details("vm1").await.unwrap().running);

        // Running VMs are rebooted and stay up
        lifecycle.restart("vm1").await.unwrap();
        assert!(lifecycle.details("vm1").await.unwrap().running);

        let err = lifecycle.restart("ghost").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_console_requires_running_vm() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let lifecycle = lifecycle(backend.clone(), dir.path());
        let (iso, drivers) = media(dir.path());
        lifecycle.create(&VmSpec::new("vm1", iso, drivers)).await.unwrap();

        let err = lifecycle.console("vm1").await.unwrap_err();
        assert!(matches!(err, LifecycleError::NotRunning(_)));

        lifecycle.start("vm1").await.unwrap();
        let console = lifecycle.console("vm1").await.unwrap();
        assert_eq!(console.host, "localhost");
        assert_eq!(console.port, 5901);
    }

    #[tokio::test]
    async fn test_details() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let lifecycle = lifecycle(backend.clone(), dir.path());
        let (iso, drivers) = media(dir.path());
        let spec = VmSpec::new("vm1", iso, drivers).with_memory(4096).with_vcpus(4);
        let disk = lifecycle.create(&spec).await.unwrap();

        let details = lifecycle.details("vm1").await.unwrap();
        assert_eq!(details.name, "vm1");
        assert!(!details.running);
        assert_eq!(details.memory_mib, 4096);
        assert_eq!(details.vcpus, 4);
        assert_eq!(details.arch.as_deref(), Some("x86_64"));
        assert!(!details.autostart);
        assert_eq!(details.disk_path, Some(disk.path));
        assert_eq!(details.vnc_port, None);
    }
}
