use proxmox_ipam::crd::AddressRange;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The control-plane endpoint a cluster's API server is reachable on.
///
/// Per §3: if the cluster is externally managed, both `host` and a nonzero
/// `port` are required before the cluster may be marked provisioned.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneEndpoint {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
}

impl ControlPlaneEndpoint {
    #[must_use]
    pub fn is_set(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VmidRange {
    pub min: u32,
    pub max: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
}

/// The cluster-scoped infra object declared by consumers (§3). Drives
/// credential-secret ownership, in-cluster IP-pool materialization, and
/// gates machine provisioning on its own readiness (§4.7).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "ProxmoxCluster",
    plural = "proxmoxclusters",
    singular = "proxmoxcluster",
    shortname = "pvecluster",
    namespaced,
    status = "ProxmoxClusterStatus",
    doc = r#"ProxmoxCluster is the Schema for the proxmoxclusters API. It declares the shared
    infrastructure (control-plane endpoint policy, IP pools, credentials, allowed hypervisor
    nodes) that every ProxmoxMachine in the cluster is provisioned against."#,
    printcolumn = r#"{"name":"Provisioned","type":"boolean","jsonPath":".status.provisioned"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_endpoint: Option<ControlPlaneEndpoint>,

    /// When set, the control-plane endpoint is not materialized by this
    /// provider; it must already be reachable at `control_plane_endpoint`
    /// before the cluster is marked provisioned.
    #[serde(default)]
    pub externally_managed: bool,

    #[serde(default)]
    pub ipv4_ranges: Vec<AddressRange>,

    #[serde(default)]
    pub ipv6_ranges: Vec<AddressRange>,

    /// Per-zone overrides, materialized as `GlobalInClusterIPPool`s rather
    /// than namespaced pools (§4.3).
    #[serde(default)]
    pub zone_ranges: BTreeMap<String, Vec<AddressRange>>,

    #[serde(default)]
    pub dns_servers: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_secret_ref: Option<SecretReference>,

    #[serde(default)]
    pub allowed_nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid_range: Option<VmidRange>,

    #[serde(default)]
    pub template_tags: Vec<String>,
}

/// Most recent observed status of the cluster. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterStatus {
    #[serde(default)]
    pub provisioned: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    /// Names of the `InClusterIPPool`/`GlobalInClusterIPPool` objects this
    /// cluster materialized and owns.
    #[serde(default)]
    pub ip_pool_refs: Vec<String>,

    /// Machine name -> hypervisor node, partitioned by role (§4.2's
    /// placement-history input).
    #[serde(default)]
    pub control_plane_node_locations: BTreeMap<String, String>,

    #[serde(default)]
    pub worker_node_locations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl ProxmoxClusterStatus {
    /// Combined node-locations map, used by the scheduler's placement-count
    /// input regardless of role.
    #[must_use]
    pub fn all_node_locations(&self) -> BTreeMap<String, String> {
        let mut all = self.control_plane_node_locations.clone();
        all.extend(self.worker_node_locations.clone());
        all
    }
}

pub const PROVISIONED_CONDITION: &str = "ProxmoxClusterProxmoxAvailable";

/// A template wrapper holding a [`ProxmoxClusterSpec`], used by the
/// upper-layer cluster-class machinery to stamp out clusters. This core has
/// no reconciler for it; the upper control plane reads it directly.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "ProxmoxClusterTemplate",
    plural = "proxmoxclustertemplates",
    singular = "proxmoxclustertemplate",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterTemplateSpec {
    pub template: ProxmoxClusterTemplateResource,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxClusterTemplateResource {
    pub spec: ProxmoxClusterSpec,
}
