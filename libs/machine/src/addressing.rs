//! Per-interface IP-address claim lifecycle (§4.3): for every interface and
//! every pool reference it carries (explicit, or the cluster's implicit
//! default), ensure a claim exists and read back whether it is bound.

use crate::crd::{NetworkDevice, ProxmoxMachine};

use proxmox_cluster::ProxmoxCluster;
use proxmox_ipam::coordinator;
use proxmox_ipam::crd::{IPAM_GROUP, IN_CLUSTER_POOL_KIND, PoolReference};
use proxmox_ipam::types::{ClaimStatus, ResolvedAddress};
use proxmox_operator::error::{Error, Result};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Client, ResourceExt};

/// Resolved addresses for one interface, in pool order (IPv4 primary first
/// per §4.3's default-pool ordering).
pub type InterfaceAddresses = Vec<ResolvedAddress>;

/// Effective pool-reference list for `device`: its own, or the cluster's
/// implicit default pools if it declares none (§4.3).
#[must_use]
pub fn effective_pool_refs(device: &NetworkDevice, cluster: &ProxmoxCluster) -> Vec<PoolReference> {
    if !device.pools.is_empty() {
        return device.pools.clone();
    }
    let status = cluster.status.clone().unwrap_or_default();
    let default_v4 = status.ip_pool_refs.iter().find(|name| name.contains("-v4-"));
    let default_v6 = status.ip_pool_refs.iter().find(|name| name.contains("-v6-"));
    coordinator::default_interface_pool_refs(default_v4.map(String::as_str), default_v6.map(String::as_str))
}

/// Ensure a claim exists for every `(device, pool)` pair and return the
/// addresses that are already bound, keyed by device name. Interfaces with
/// any still-unbound claim are simply absent from the result; the caller
/// requeues until every interface resolves.
pub async fn ensure_and_collect(
    client: Client,
    namespace: &str,
    machine: &ProxmoxMachine,
    cluster: &ProxmoxCluster,
) -> Result<std::collections::BTreeMap<String, InterfaceAddresses>> {
    let owner = machine_owner_ref(machine);
    let mut resolved = std::collections::BTreeMap::new();

    for (idx, device) in machine.spec.network.iter().enumerate() {
        let device_name = device.name.clone().unwrap_or_else(|| format!("net{idx}"));
        let pool_refs = effective_pool_refs(device, cluster);
        let mut addresses = Vec::new();
        let mut all_bound = true;

        for (offset, pool_ref) in pool_refs.iter().enumerate() {
            let family = family_of(pool_ref);
            let claim = coordinator::claim_name(&machine.name_any(), &pool_ref.name, offset as u32, family);
            coordinator::ensure_claim(client.clone(), namespace, &claim, owner.clone(), pool_ref.clone())
                .await
                .map_err(Error::Ipam)?;
            match coordinator::read_claim(client.clone(), namespace, &claim).await.map_err(Error::Ipam)? {
                ClaimStatus::Bound(resolved_address) => addresses.push(resolved_address),
                ClaimStatus::NotYetBound => all_bound = false,
            }
        }

        if all_bound && !addresses.is_empty() {
            resolved.insert(device_name, addresses);
        }
    }

    Ok(resolved)
}

fn family_of(pool_ref: &PoolReference) -> proxmox_ipam::types::Family {
    if pool_ref.name.contains("v6") {
        proxmox_ipam::types::Family::V6
    } else {
        proxmox_ipam::types::Family::V4
    }
}

fn machine_owner_ref(machine: &ProxmoxMachine) -> OwnerReference {
    OwnerReference {
        api_version: "infrastructure.cluster.x-k8s.io/v1alpha2".to_string(),
        kind: "ProxmoxMachine".to_string(),
        name: machine.name_any(),
        uid: machine.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

#[must_use]
pub fn in_cluster_pool_ref(name: &str) -> PoolReference {
    PoolReference {
        api_group: IPAM_GROUP.to_string(),
        kind: IN_CLUSTER_POOL_KIND.to_string(),
        name: name.to_string(),
        metric: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proxmox_cluster::crd::ProxmoxClusterStatus;

    #[test]
    fn device_with_explicit_pools_never_falls_back_to_cluster_defaults() {
        let mut device = NetworkDevice::default();
        device.pools = vec![in_cluster_pool_ref("custom")];
        let cluster = ProxmoxCluster::new("c", Default::default());
        let refs = effective_pool_refs(&device, &cluster);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "custom");
    }

    #[test]
    fn device_with_no_pools_uses_cluster_default_v4_and_v6() {
        let device = NetworkDevice::default();
        let mut cluster = ProxmoxCluster::new("c", Default::default());
        cluster.status = Some(ProxmoxClusterStatus {
            ip_pool_refs: vec!["c-v4-0".to_string(), "c-v6-0".to_string()],
            ..Default::default()
        });
        let refs = effective_pool_refs(&device, &cluster);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "c-v4-0");
        assert_eq!(refs[1].name, "c-v6-0");
    }
}
