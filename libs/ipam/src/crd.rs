//! Custom resources this core only ever creates and reads, never reconciles:
//! the external IPAM pool controller referenced by §4.3 of the design owns
//! the loop that binds a claim to an address.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Points at a pool object, namespaced or cluster-scoped, by group/kind/name.
/// Mirrors the Cluster API IPAM `TypedLocalObjectReference` contract.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PoolReference {
    pub api_group: String,
    pub kind: String,
    pub name: String,
    /// Guest-side routing metric propagated from the pool's own metric
    /// annotation; resolved when the pool is read, not part of the wire
    /// reference itself, but carried alongside it for convenience.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

pub const IPAM_GROUP: &str = "ipam.cluster.x-k8s.io";
pub const IPAM_VERSION: &str = "v1beta1";
pub const IN_CLUSTER_POOL_KIND: &str = "InClusterIPPool";
pub const GLOBAL_IN_CLUSTER_POOL_KIND: &str = "GlobalInClusterIPPool";

/// A request for one address out of a pool. Becomes bound once the external
/// pool controller sets `status.addressRef`.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "IPAddressClaim",
    plural = "ipaddressclaims",
    singular = "ipaddressclaim",
    namespaced,
    status = "IPAddressClaimStatus",
    printcolumn = r#"{"name":"Pool","type":"string","jsonPath":".spec.poolRef.name"}"#,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".status.addressRef.name"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimSpec {
    pub pool_ref: PoolReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct IPAddressClaimStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_ref: Option<k8s_openapi::api::core::v1::LocalObjectReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
}

/// The bound address object, written by the external pool controller.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "IPAddress",
    plural = "ipaddresses",
    singular = "ipaddress",
    namespaced,
    printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gateway"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct IPAddressSpec {
    pub pool_ref: PoolReference,
    pub claim_ref: k8s_openapi::api::core::v1::LocalObjectReference,
    pub address: String,
    pub prefix: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// One contiguous or ranged block of addresses an `InClusterIPPool` draws from.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct AddressRange {
    /// Either a CIDR (`10.10.10.0/24`) or a range (`10.10.10.2-10.10.10.10`).
    pub addresses: Vec<String>,
    pub prefix: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

/// A namespace-scoped, cluster-materialized pool (one per `ProxmoxCluster`
/// address range in §4.3).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "InClusterIPPool",
    plural = "inclusterippools",
    singular = "inclusterippool",
    namespaced,
    printcolumn = r#"{"name":"Prefix","type":"integer","jsonPath":".spec.prefix"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gateway"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct InClusterIPPoolSpec {
    #[serde(flatten)]
    pub range: AddressRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}

/// Cluster-scoped equivalent of [`InClusterIPPool`], used for per-zone overrides.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "ipam.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "GlobalInClusterIPPool",
    plural = "globalinclusterippools",
    singular = "globalinclusterippool",
    printcolumn = r#"{"name":"Prefix","type":"integer","jsonPath":".spec.prefix"}"#,
    printcolumn = r#"{"name":"Gateway","type":"string","jsonPath":".spec.gateway"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct GlobalInClusterIPPoolSpec {
    #[serde(flatten)]
    pub range: AddressRange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
}
