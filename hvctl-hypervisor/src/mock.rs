//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

use crate::descriptor::{DomainDocument, DEFAULT_NETWORK};
use crate::error::{HypervisorError, Result};
use crate::traits::Hypervisor;
use crate::types::DomainRef;

/// First runtime ID handed out, mirroring libvirt which starts at 1.
const FIRST_DOMAIN_ID: u32 = 1;

/// Base VNC port assigned to running mock domains.
const VNC_BASE_PORT: u32 = 5900;

/// Operations that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    List,
    Define,
    Start,
    Shutdown,
    Destroy,
    Reboot,
    Undefine,
    Descriptor,
}

/// Mock hypervisor backend.
///
/// Keeps domains in memory, in definition order. Useful for:
/// - Unit and integration testing
/// - Development without libvirt installed (`hvctl --dev`)
///
/// Shutdown is modelled as a guest that powers off as soon as it gets the
/// ACPI request.
pub struct MockBackend {
    state: RwLock<MockState>,
    failures: RwLock<HashSet<MockOp>>,
}

struct MockState {
    domains: Vec<MockDomain>,
    networks: Vec<(String, bool)>,
    next_id: u32,
    mutations: usize,
}

struct MockDomain {
    uuid: String,
    name: String,
    xml: String,
    id: Option<u32>,
    autostart: bool,
}

impl MockDomain {
    fn is_active(&self) -> bool {
        self.id.is_some()
    }

    fn to_ref(&self) -> DomainRef {
        DomainRef {
            name: self.name.clone(),
            uuid: self.uuid.clone(),
        }
    }
}

impl MockBackend {
    /// Create a mock backend with an active `default` network.
    pub fn new() -> Self {
        info!("Creating mock hypervisor backend");
        Self {
            state: RwLock::new(MockState {
                domains: Vec::new(),
                networks: vec![(DEFAULT_NETWORK.to_string(), true)],
                next_id: FIRST_DOMAIN_ID,
                mutations: 0,
            }),
            failures: RwLock::new(HashSet::new()),
        }
    }

    /// Add or replace a network.
    pub fn with_network(self, name: impl Into<String>, active: bool) -> Self {
        let name = name.into();
        if let Ok(mut state) = self.state.write() {
            state.networks.retain(|(n, _)| *n != name);
            state.networks.push((name, active));
        }
        self
    }

    /// Make every subsequent call of `op` fail until cleared.
    pub fn fail(&self, op: MockOp) {
        if let Ok(mut failures) = self.failures.write() {
            failures.insert(op);
        }
    }

    /// Stop failing `op`.
    pub fn clear_failure(&self, op: MockOp) {
        if let Ok(mut failures) = self.failures.write() {
            failures.remove(&op);
        }
    }

    /// Number of state-changing calls that succeeded.
    pub fn mutation_count(&self) -> usize {
        self.state.read().map(|s| s.mutations).unwrap_or_default()
    }

    /// Number of defined domains.
    pub fn domain_count(&self) -> usize {
        self.state.read().map(|s| s.domains.len()).unwrap_or_default()
    }

    fn check(&self, op: MockOp) -> Result<()> {
        let failures = self.failures.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })?;
        if failures.contains(&op) {
            return Err(HypervisorError::OperationFailed(format!("injected {:?} failure", op)));
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MockState>> {
        self.state.read().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MockState>> {
        self.state.write().map_err(|_| {
            HypervisorError::Internal("Lock poisoned".to_string())
        })
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockState {
    fn find(&self, domain: &DomainRef) -> Result<&MockDomain> {
        self.domains
            .iter()
            .find(|d| d.uuid == domain.uuid)
            .ok_or_else(|| HypervisorError::DomainNotFound(domain.name.clone()))
    }

    fn find_mut(&mut self, domain: &DomainRef) -> Result<&mut MockDomain> {
        self.domains
            .iter_mut()
            .find(|d| d.uuid == domain.uuid)
            .ok_or_else(|| HypervisorError::DomainNotFound(domain.name.clone()))
    }
}

#[async_trait]
impl Hypervisor for MockBackend {
    async fn list_active_ids(&self) -> Result<Vec<u32>> {
        self.check(MockOp::List)?;
        let state = self.read()?;
        Ok(state.domains.iter().filter_map(|d| d.id).collect())
    }

    async fn list_defined_names(&self) -> Result<Vec<String>> {
        self.check(MockOp::List)?;
        let state = self.read()?;
        Ok(state
            .domains
            .iter()
            .filter(|d| !d.is_active())
            .map(|d| d.name.clone())
            .collect())
    }

    async fn lookup_by_id(&self, id: u32) -> Result<Option<DomainRef>> {
        let state = self.read()?;
        Ok(state.domains.iter().find(|d| d.id == Some(id)).map(MockDomain::to_ref))
    }

    async fn lookup_by_name(&self, name: &str) -> Result<Option<DomainRef>> {
        let state = self.read()?;
        Ok(state.domains.iter().find(|d| d.name == name).map(MockDomain::to_ref))
    }

    #[instrument(skip(self, xml))]
    async fn define(&self, xml: &str) -> Result<DomainRef> {
        self.check(MockOp::Define)?;

        let doc = DomainDocument::from_xml(xml)?;
        if doc.name.is_empty() {
            return Err(HypervisorError::XmlError("domain has no name".to_string()));
        }

        let mut state = self.write()?;
        if state.domains.iter().any(|d| d.name == doc.name) {
            return Err(HypervisorError::OperationFailed(format!(
                "domain '{}' already exists",
                doc.name
            )));
        }

        let domain = MockDomain {
            uuid: doc.uuid.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: doc.name,
            xml: xml.to_string(),
            id: None,
            autostart: false,
        };
        let domain_ref = domain.to_ref();
        state.domains.push(domain);
        state.mutations += 1;

        info!(vm = %domain_ref.name, "Mock domain defined");
        Ok(domain_ref)
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn start(&self, domain: &DomainRef) -> Result<()> {
        self.check(MockOp::Start)?;

        let mut state = self.write()?;
        let id = state.next_id;
        let vm = state.find_mut(domain)?;
        if vm.is_active() {
            return Err(HypervisorError::OperationFailed("domain is already running".to_string()));
        }
        vm.id = Some(id);
        state.next_id += 1;
        state.mutations += 1;

        debug!(id = id, "Mock domain started");
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn shutdown(&self, domain: &DomainRef) -> Result<()> {
        self.check(MockOp::Shutdown)?;

        let mut state = self.write()?;
        let vm = state.find_mut(domain)?;
        if !vm.is_active() {
            return Err(HypervisorError::OperationFailed("domain is not running".to_string()));
        }
        vm.id = None;
        state.mutations += 1;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn destroy(&self, domain: &DomainRef) -> Result<()> {
        self.check(MockOp::Destroy)?;

        let mut state = self.write()?;
        let vm = state.find_mut(domain)?;
        if !vm.is_active() {
            return Err(HypervisorError::OperationFailed("domain is not running".to_string()));
        }
        vm.id = None;
        state.mutations += 1;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn reboot(&self, domain: &DomainRef) -> Result<()> {
        self.check(MockOp::Reboot)?;

        let mut state = self.write()?;
        let vm = state.find_mut(domain)?;
        if !vm.is_active() {
            return Err(HypervisorError::OperationFailed("domain is not running".to_string()));
        }
        state.mutations += 1;
        Ok(())
    }

    #[instrument(skip(self), fields(vm = %domain.name))]
    async fn undefine(&self, domain: &DomainRef) -> Result<()> {
        self.check(MockOp::Undefine)?;

        let mut state = self.write()?;
        let before = state.domains.len();
        state.domains.retain(|d| d.uuid != domain.uuid);
        if state.domains.len() == before {
            return Err(HypervisorError::DomainNotFound(domain.name.clone()));
        }
        state.mutations += 1;

        info!("Mock domain undefined");
        Ok(())
    }

    async fn is_active(&self, domain: &DomainRef) -> Result<bool> {
        let state = self.read()?;
        Ok(state.find(domain)?.is_active())
    }

    async fn descriptor(&self, domain: &DomainRef) -> Result<String> {
        self.check(MockOp::Descriptor)?;

        let state = self.read()?;
        let vm = state.find(domain)?;
        // Running domains report the VNC port libvirt would have assigned.
        Ok(match vm.id {
            Some(id) => {
                let port = format!("port=\"{}\"", VNC_BASE_PORT + id);
                vm.xml.replace("port=\"-1\"", &port).replace("port='-1'", &port)
            }
            None => vm.xml.clone(),
        })
    }

    async fn autostart(&self, domain: &DomainRef) -> Result<bool> {
        let state = self.read()?;
        Ok(state.find(domain)?.autostart)
    }

    async fn network_active(&self, name: &str) -> Result<Option<bool>> {
        let state = self.read()?;
        Ok(state.networks.iter().find(|(n, _)| n == name).map(|(_, active)| *active))
    }

    async fn start_network(&self, name: &str) -> Result<()> {
        let mut state = self.write()?;
        let network = state
            .networks
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| HypervisorError::OperationFailed(format!("network '{}' not found", name)))?;
        if network.1 {
            return Err(HypervisorError::OperationFailed(format!("network '{}' is already active", name)));
        }
        network.1 = true;
        state.mutations += 1;
        Ok(())
    }
}
