use serde::{Deserialize, Serialize};

/// References a VM on a specific hypervisor node. Proxmox VMIDs are unique
/// cluster-wide, but most endpoints are addressed through the node anyway.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmRef {
    pub node: String,
    pub vmid: u32,
}

/// A Proxmox UPID (`"UPID:node:..."`), the handle returned by any asynchronous operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub node: String,
    pub upid: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopped,
    Paused,
    Hibernated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Success,
    Failed,
}

/// A parsed `net{N}` config line: `"{model}={MAC},bridge={br}[,mtu={n}][,tag={v}]"`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkInterfaceConfig {
    pub model: String,
    pub mac: String,
    pub bridge: String,
    pub mtu: Option<u32>,
    pub tag: Option<u32>,
}

/// The hypervisor's observed view of a VM, as returned by `GetVM`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedVm {
    pub vmid: u32,
    pub node: String,
    /// Proxmox `name` field; empty until the VM's first config write completes.
    pub name: String,
    pub firmware_uuid: Option<String>,
    pub power_state: PowerState,
    pub sockets: u32,
    pub cores: u32,
    pub memory_mib: u32,
    pub tags: Vec<String>,
    /// `(device name e.g. "net0", parsed config)`, in device-name order.
    pub interfaces: Vec<(String, NetworkInterfaceConfig)>,
}

#[derive(Clone, Debug)]
pub struct CloneRequest {
    pub template: VmRef,
    pub target_node: String,
    pub target_vmid: u32,
    pub name: String,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigureRequest {
    pub sockets: Option<u32>,
    pub cores: Option<u32>,
    pub memory_mib: Option<u32>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    /// `(device name, desired config)`.
    pub interfaces: Vec<(String, NetworkInterfaceConfig)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloudInitStatus {
    NotPresent,
    Running,
    Done,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QemuAgentStatus {
    Unreachable,
    Ready,
}
