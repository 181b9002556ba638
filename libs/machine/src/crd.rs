//! `ProxmoxMachine` custom resource (§3): the namespace-scoped declaration
//! of one VM, and the per-interface network wiring it carries.

use proxmox_ipam::crd::PoolReference;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Where the clone source VM comes from (§3 "template source").
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub enum TemplateSource {
    /// An explicit template VM id on a source node.
    Explicit { node: String, vmid: u32 },
    /// Selected by matching all of `tags` on a template VM, restricted to
    /// the effective allow-list when non-empty.
    TagSelector { tags: Vec<String> },
}

impl Default for TemplateSource {
    fn default() -> Self {
        TemplateSource::TagSelector { tags: Vec::new() }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VmidRange {
    pub min: u32,
    pub max: u32,
}

/// Optional boot-disk resize target, applied once while the VM is not yet
/// running and not yet `Ready` (§4.1 idempotence rule).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct BootDisk {
    pub size_gib: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    /// Disk key to resize, e.g. `scsi0`. Defaults to `scsi0` if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<String>,
}

impl BootDisk {
    #[must_use]
    pub fn disk_key(&self) -> &str {
        self.disk.as_deref().unwrap_or("scsi0")
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PolicyRuleSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub table: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

/// One `net{N}` interface (§3 `NetworkDevice`): bridge, model, optional
/// MTU/VLAN tag, DNS servers, an ordered pool-reference list, and a guest
/// routing table. An empty `pools` list on the first declared interface
/// means "use the cluster's default IPv4/IPv6 pools" (§4.3).
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct NetworkDevice {
    /// Hypervisor-side device name (`net0`, `net1`, ...). Assigned by
    /// position when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub bridge: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vlan_tag: Option<u32>,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub pools: Vec<PoolReference>,
    #[serde(default)]
    pub routes: Vec<RouteSpec>,
    #[serde(default)]
    pub policy_rules: Vec<PolicyRuleSpec>,
}

fn default_model() -> String {
    "virtio".to_string()
}

/// Aggregates existing named interfaces under one routing table id (§3).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct VrfDevice {
    pub name: String,
    pub table: u32,
    pub members: Vec<String>,
}

/// The namespace-scoped infra object declared by consumers (§3): one VM's
/// template, sizing, network wiring, and placement overrides.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "ProxmoxMachine",
    plural = "proxmoxmachines",
    singular = "proxmoxmachine",
    shortname = "pvemachine",
    namespaced,
    status = "ProxmoxMachineStatus",
    doc = r#"ProxmoxMachine is the Schema for the proxmoxmachines API. It declares one VM:
    template source, CPU/memory/disk, network interfaces, and bootstrap wiring."#,
    printcolumn = r#"{"name":"VMID","type":"integer","jsonPath":".status.vmid"}"#,
    printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.node"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.conditions[?(@.type == 'VMProvisioned')].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineSpec {
    /// Name of the `ProxmoxCluster` in the same namespace this machine
    /// belongs to.
    pub cluster_name: String,

    #[serde(default)]
    pub template_source: TemplateSource,

    #[serde(default = "default_sockets")]
    pub sockets: u32,
    #[serde(default = "default_cores")]
    pub cores: u32,
    pub memory_mib: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_disk: Option<BootDisk>,

    #[serde(default)]
    pub network: Vec<NetworkDevice>,

    #[serde(default)]
    pub vrfs: Vec<VrfDevice>,

    /// Overrides the cluster's allow-list when non-empty (§4.2).
    #[serde(default)]
    pub allowed_nodes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid_range: Option<VmidRange>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_sockets() -> u32 {
    1
}

fn default_cores() -> u32 {
    1
}

impl ProxmoxMachineSpec {
    /// Effective allow-list per §4.2: machine-level overrides cluster-level.
    #[must_use]
    pub fn effective_allow_list<'a>(&'a self, cluster_allow_list: &'a [String]) -> &'a [String] {
        if self.allowed_nodes.is_empty() {
            cluster_allow_list
        } else {
            &self.allowed_nodes
        }
    }
}

/// A resolved in-flight hypervisor task, at most one per machine (§4.4).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct TaskRefStatus {
    pub node: String,
    pub upid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<Time>,
}

/// A CAPI-style published address (§4.1 state 8).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    #[serde(rename = "type")]
    pub address_type: String,
    pub address: String,
}

pub const ADDRESS_TYPE_HOSTNAME: &str = "Hostname";
pub const ADDRESS_TYPE_INTERNAL_IP: &str = "InternalIP";

/// Most recent observed status of the machine. Read-only.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vmid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRefStatus>,

    /// Per-interface assigned addresses, keyed by device name (`net0`, ...).
    #[serde(default)]
    pub ip_addresses: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub bootstrap_provided: bool,

    /// Cached from the upper-layer Machine the first time it is observed
    /// (§4.1 state `WaitingForBootstrapData`), so later states don't need to
    /// keep re-resolving the owner chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootstrap_data_secret_name: Option<String>,

    /// The boot-disk size, in GiB, this machine last issued a resize call
    /// for; used to make resize idempotent (§4.1 idempotence rule).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_disk_resize_gib: Option<u64>,

    #[serde(default)]
    pub addresses: Vec<MachineAddress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,

    /// `proxmox://{firmwareUUID}`, derived once the VM reports a firmware
    /// UUID and stable thereafter (§3 invariant).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

pub const VM_PROVISIONED_CONDITION: &str = "VMProvisioned";

/// `"default"` is the well-known key the machine's primary interface
/// resolves under in `ip_addresses`/cloud-init rendering, before the VM may
/// be powered on (§3 invariant).
pub const DEFAULT_INTERFACE: &str = "default";

/// Thin template wrapper, read directly by upper-layer stamping machinery;
/// no reconciler in this core (§3).
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha2",
    kind = "ProxmoxMachineTemplate",
    plural = "proxmoxmachinetemplates",
    singular = "proxmoxmachinetemplate",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineTemplateSpec {
    pub template: ProxmoxMachineTemplateResource,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxMachineTemplateResource {
    pub spec: ProxmoxMachineSpec,
}
