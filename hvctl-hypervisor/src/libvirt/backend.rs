//! Libvirt backend implementation.

use async_trait::async_trait;
use tracing::{debug, info, instrument};
use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::DomainRef;

/// Libvirt/QEMU hypervisor backend.
///
/// Domains are re-resolved by UUID on every call, so a [`DomainRef`] that
/// outlived its domain yields `DomainNotFound` instead of acting on a stale
/// handle.
pub struct LibvirtBackend {
    uri: String,
    connection: Connect,
}

impl LibvirtBackend {
    /// Connect to the specified URI.
    ///
    /// Common URIs:
    /// - `qemu:///system` - System-wide QEMU/KVM
    /// - `qemu:///session` - User session QEMU
    pub async fn connect(uri: &str) -> Result<Self> {
        info!(uri = %uri, "Connecting to libvirt");

        let connection = Connect::open(Some(uri))
            .map_err(|e| HypervisorError::ConnectionFailed(e.to_string()))?;

        info!("Connected to libvirt");

        Ok(Self {
            uri: uri.to_string(),
            connection,
        })
    }

    /// URI this backend is connected to.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Re-resolve a domain handle.
    fn get_domain(&self, domain: &DomainRef) -> Result<Domain> {
        Domain::lookup_by_uuid_string(&self.connection, &domain.uuid)
            .map_err(|e| HypervisorError::DomainNotFound(format!("{}: {}", domain.name, e)))
    }

    fn to_ref(domain: &Domain) -> Result<DomainRef> {
        let name = domain
            .get_name()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        let uuid = domain
            .get_uuid_string()
            .map_err(|e| HypervisorError::Internal(e.to_string()))?;
        Ok(DomainRef { name, uuid })
    }

    /// Map a lookup result, treating "no such domain" as absence.
    fn found(result: std::result::Result<Domain, virt::error::Error>) -> Result<Option<DomainRef>> {
        match result {
            Ok(domain) => Self::to_ref(&domain).map(Some),
            Err(e) if matches!(e.code(), ErrorNumber::NoDomain) => Ok(None),
            Err(e) => Err(HypervisorError::OperationFailed(e.to_string())),
        }
    }
}

#[async_trait]
impl Hypervisor for LibvirtBackend {
    #[instrument(skip(self))]
    async fn list_active_ids(&self) -> Result<Vec<u32>> {
        let ids = self
            .connection
            .list_domains()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        debug!(count = ids.len(), "Listed active domains");
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn list_defined_names(&self) -> Result<Vec<String>> {
        let names = self
            .connection
            .list_defined_domains()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        debug!(count = names.len(), "Listed inactive domains");
        Ok(names)
    }

    async fn lookup_by_id(&self, id: u32) -> Result<Option<DomainRef>> {
        Self::found(Domain::lookup_by_id(&self.connection, id))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Option<DomainRef>> {
        Self::found(Domain::lookup_by_name(&self.connection, name))
    }

    #[instrument(skip(self, xml))]
    async fn define(&self, xml: &str) -> Result<DomainRef> {
        // Persistent definition; the domain is not started
        let domain = Domain::define_xml(&self.connection, xml)
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;

        let domain_ref = Self::to_ref(&domain)?;
        info!(vm = %domain_ref.name, uuid = %domain_ref.uuid, "Domain defined");
        Ok(domain_ref)
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn start(&self, domain: &DomainRef) -> Result<()> {
        self.get_domain(domain)?
            .create()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn shutdown(&self, domain: &DomainRef) -> Result<()> {
        // Send ACPI shutdown
        self.get_domain(domain)?
            .shutdown()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn destroy(&self, domain: &DomainRef) -> Result<()> {
        self.get_domain(domain)?
            .destroy()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn reboot(&self, domain: &DomainRef) -> Result<()> {
        self.get_domain(domain)?
            .reboot(sys::VIR_DOMAIN_REBOOT_DEFAULT)
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn undefine(&self, domain: &DomainRef) -> Result<()> {
        self.get_domain(domain)?
            .undefine()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        Ok(())
    }

    async fn is_active(&self, domain: &DomainRef) -> Result<bool> {
        self.get_domain(domain)?
            .is_active()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))
    }

    async fn descriptor(&self, domain: &DomainRef) -> Result<String> {
        self.get_domain(domain)?
            .get_xml_desc(0)
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))
    }

    async fn autostart(&self, domain: &DomainRef) -> Result<bool> {
        self.get_domain(domain)?
            .get_autostart()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))
    }

    async fn network_active(&self, name: &str) -> Result<Option<bool>> {
        match Network::lookup_by_name(&self.connection, name) {
            Ok(network) => network
                .is_active()
                .map(Some)
                .map_err(|e| HypervisorError::OperationFailed(e.to_string())),
            Err(e) if matches!(e.code(), ErrorNumber::NoNetwork) => Ok(None),
            Err(e) => Err(HypervisorError::OperationFailed(e.to_string())),
        }
    }

    #[instrument(skip(self))]
    async fn start_network(&self, name: &str) -> Result<()> {
        let network = Network::lookup_by_name(&self.connection, name)
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        network
            .create()
            .map_err(|e| HypervisorError::OperationFailed(e.to_string()))?;
        info!(network = %name, "Network started");
        Ok(())
    }
}
