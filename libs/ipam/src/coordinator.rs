//! Per-interface address claim lifecycle (§4.3): materialize a claim per
//! `(interface, pool)` pair, wait for the external pool controller to bind
//! it, and expose the resolved address to callers (the bootstrap renderer).
//!
//! This never reconciles `IPAddressClaim`/`IPAddress` objects itself — an
//! external collaborator owns that loop, per §1. It only creates and reads.

use crate::crd::{
    AddressRange, GLOBAL_IN_CLUSTER_POOL_KIND, GlobalInClusterIPPoolSpec, IN_CLUSTER_POOL_KIND,
    IPAM_GROUP, IPAddress, IPAddressClaim, IPAddressClaimSpec, InClusterIPPoolSpec, PoolReference,
};
use crate::error::{Error, Result};
use crate::types::{ClaimStatus, Family, ResolvedAddress};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, trace};

/// Deterministic claim name: `{machineName}-{poolName}-{offset}-{suffix}`.
#[must_use]
pub fn claim_name(machine_name: &str, pool_name: &str, offset: u32, family: Family) -> String {
    format!("{machine_name}-{pool_name}-{offset}-{}", family.suffix())
}

/// Create the claim if it does not already exist; idempotent across
/// reconciliations (create-if-absent, never overwritten).
pub async fn ensure_claim(
    client: Client,
    namespace: &str,
    name: &str,
    owner: OwnerReference,
    pool_ref: PoolReference,
) -> Result<()> {
    let api: Api<IPAddressClaim> = Api::namespaced(client, namespace);
    if api.get_opt(name).await.map_err(|e| Error::Kube("get claim".into(), Box::new(e)))?.is_some() {
        trace!(msg = "claim already exists", claim = name);
        return Ok(());
    }
    let claim = IPAddressClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: IPAddressClaimSpec { pool_ref },
        status: None,
    };
    debug!(msg = "creating address claim", claim = name);
    api.create(&PostParams::default(), &claim)
        .await
        .map_err(|e| Error::Kube(format!("failed to create claim {namespace}/{name}"), Box::new(e)))?;
    Ok(())
}

/// Poll a claim's binding state. Returns [`ClaimStatus::NotYetBound`] (never
/// an error) until the external controller sets `status.addressRef`.
pub async fn read_claim(client: Client, namespace: &str, name: &str) -> Result<ClaimStatus> {
    let claims: Api<IPAddressClaim> = Api::namespaced(client.clone(), namespace);
    let claim = claims
        .get(name)
        .await
        .map_err(|e| Error::Kube(format!("failed to get claim {namespace}/{name}"), Box::new(e)))?;
    let Some(address_ref) = claim.status.and_then(|s| s.address_ref) else {
        return Ok(ClaimStatus::NotYetBound);
    };
    let addresses: Api<IPAddress> = Api::namespaced(client, namespace);
    let address = addresses
        .get(&address_ref.name.unwrap_or_default())
        .await
        .map_err(|e| Error::Kube(format!("failed to get bound address for claim {namespace}/{name}"), Box::new(e)))?;
    Ok(ClaimStatus::Bound(ResolvedAddress {
        family: Family::of_address(&address.spec.address),
        address: address.spec.address,
        prefix: address.spec.prefix,
        gateway: address.spec.gateway,
        metric: address.spec.pool_ref.metric,
    }))
}

/// Build the implicit pool-reference list for a default interface that
/// declares no pools of its own: the cluster's default IPv4/IPv6
/// in-cluster pools, in that order (IPv4 primary).
#[must_use]
pub fn default_interface_pool_refs(default_v4_pool: Option<&str>, default_v6_pool: Option<&str>) -> Vec<PoolReference> {
    let mut refs = Vec::new();
    if let Some(name) = default_v4_pool {
        refs.push(PoolReference {
            api_group: IPAM_GROUP.to_string(),
            kind: IN_CLUSTER_POOL_KIND.to_string(),
            name: name.to_string(),
            metric: None,
        });
    }
    if let Some(name) = default_v6_pool {
        refs.push(PoolReference {
            api_group: IPAM_GROUP.to_string(),
            kind: IN_CLUSTER_POOL_KIND.to_string(),
            name: name.to_string(),
            metric: None,
        });
    }
    refs
}

/// Build the namespaced `InClusterIPPool` spec materialized from a cluster's
/// address range, per §4.3 / §4.7 step 4.
#[must_use]
pub fn materialize_in_cluster_pool_spec(range: AddressRange, metric: Option<u32>) -> InClusterIPPoolSpec {
    InClusterIPPoolSpec { range, metric }
}

/// Build the cluster-scoped `GlobalInClusterIPPool` spec for a per-zone
/// override.
#[must_use]
pub fn materialize_global_pool_spec(range: AddressRange, metric: Option<u32>) -> GlobalInClusterIPPoolSpec {
    GlobalInClusterIPPoolSpec { range, metric }
}

/// Resolve the kind string of a cluster-scoped pool reference, for callers
/// building a [`PoolReference`] to a per-zone override pool.
#[must_use]
pub fn global_pool_reference(name: &str) -> PoolReference {
    PoolReference {
        api_group: IPAM_GROUP.to_string(),
        kind: GLOBAL_IN_CLUSTER_POOL_KIND.to_string(),
        name: name.to_string(),
        metric: None,
    }
}

/// Owner reference of a claim, used when reading back who owns it (for the
/// rare log message that needs it); kept as a thin accessor so callers don't
/// reach into the CRD type directly.
#[must_use]
pub fn claim_owner_name(claim: &IPAddressClaim) -> String {
    claim.name_any()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn claim_name_is_deterministic() {
        assert_eq!(
            claim_name("worker-0", "default-v4", 0, Family::V4),
            "worker-0-default-v4-0-inet"
        );
        assert_eq!(
            claim_name("worker-0", "default-v6", 0, Family::V6),
            "worker-0-default-v6-0-inet6"
        );
    }

    #[test]
    fn default_interface_refs_prefer_v4_primary() {
        let refs = default_interface_pool_refs(Some("v4-pool"), Some("v6-pool"));
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "v4-pool");
        assert_eq!(refs[1].name, "v6-pool");
    }

    #[test]
    fn default_interface_refs_empty_when_cluster_has_no_default_pools() {
        assert!(default_interface_pool_refs(None, None).is_empty());
    }
}
