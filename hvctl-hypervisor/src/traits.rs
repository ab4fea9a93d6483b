//! Core hypervisor abstraction trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::DomainRef;

/// Hypervisor connection used by the lifecycle workflows.
///
/// This trait is deliberately narrow: it exposes the primitives the
/// orchestrator composes (lookup, define, start, shutdown, destroy, undefine,
/// descriptor retrieval) and nothing more. One implementation wraps a libvirt
/// connection, the other keeps domains in memory for tests and development.
///
/// Methods taking a [`DomainRef`] fail with
/// [`HypervisorError::DomainNotFound`](crate::HypervisorError::DomainNotFound)
/// if the domain disappeared after it was looked up.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    // =========================================================================
    // Enumeration & Lookup
    // =========================================================================

    /// Runtime IDs of running domains.
    async fn list_active_ids(&self) -> Result<Vec<u32>>;

    /// Names of defined but inactive domains.
    async fn list_defined_names(&self) -> Result<Vec<String>>;

    /// Resolve a running domain by runtime ID.
    async fn lookup_by_id(&self, id: u32) -> Result<Option<DomainRef>>;

    /// Resolve a domain by name.
    async fn lookup_by_name(&self, name: &str) -> Result<Option<DomainRef>>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a persistent domain from its XML descriptor (does not start it).
    async fn define(&self, xml: &str) -> Result<DomainRef>;

    /// Start a defined domain.
    async fn start(&self, domain: &DomainRef) -> Result<()>;

    /// Request an ACPI shutdown. Returns once the request is accepted.
    async fn shutdown(&self, domain: &DomainRef) -> Result<()>;

    /// Power off immediately.
    async fn destroy(&self, domain: &DomainRef) -> Result<()>;

    /// Reboot a running domain.
    async fn reboot(&self, domain: &DomainRef) -> Result<()>;

    /// Remove the domain registration.
    async fn undefine(&self, domain: &DomainRef) -> Result<()>;

    // =========================================================================
    // Status
    // =========================================================================

    /// Whether the domain is currently running.
    async fn is_active(&self, domain: &DomainRef) -> Result<bool>;

    /// Current XML descriptor as recorded by the hypervisor.
    async fn descriptor(&self, domain: &DomainRef) -> Result<String>;

    /// Whether the domain starts with the host.
    async fn autostart(&self, domain: &DomainRef) -> Result<bool>;

    // =========================================================================
    // Networks
    // =========================================================================

    /// `Some(active)` for a defined network, `None` if it does not exist.
    async fn network_active(&self, name: &str) -> Result<Option<bool>>;

    /// Start a defined network.
    async fn start_network(&self, name: &str) -> Result<()>;
}
