//! Domain inventory.

use tracing::{debug, instrument};

use crate::error::LifecycleError;
use crate::traits::Hypervisor;
use crate::types::{ActiveDomain, InactiveDomain, Inventory};

/// List running and defined-but-inactive domains.
///
/// Order is whatever the hypervisor reports. A domain that stops between
/// enumeration and lookup is skipped.
#[instrument(skip(hypervisor))]
pub async fn list_domains(hypervisor: &dyn Hypervisor) -> Result<Inventory, LifecycleError> {
    let unavailable = |e: crate::HypervisorError| LifecycleError::InventoryUnavailable(e.to_string());

    let ids = hypervisor.list_active_ids().await.map_err(unavailable)?;

    let mut active = Vec::with_capacity(ids.len());
    for id in ids {
        match hypervisor.lookup_by_id(id).await.map_err(unavailable)? {
            Some(domain) => active.push(ActiveDomain { id, name: domain.name }),
            None => debug!(id = id, "Domain vanished during listing, skipping"),
        }
    }

    let inactive = hypervisor
        .list_defined_names()
        .await
        .map_err(unavailable)?
        .into_iter()
        .map(|name| InactiveDomain { name })
        .collect();

    let inventory = Inventory { active, inactive };
    debug!(count = inventory.len(), "Listed domains");
    Ok(inventory)
}
