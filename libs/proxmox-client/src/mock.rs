//! An in-memory [`ProxmoxClient`] double for reconciler unit tests, grounded
//! in the same "fake server the reconciler talks to" shape as a Kubernetes
//! fake-apiserver test harness, adapted to the hypervisor instead.

use crate::client::ProxmoxClient;
use crate::error::{Error, Result};
use crate::types::{
    CloneRequest, CloudInitStatus, ConfigureRequest, ObservedVm, PowerState, QemuAgentStatus,
    TaskRef, TaskState, VmRef,
};

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

#[derive(Clone, Debug, Default)]
pub struct MockVm {
    pub observed: ObservedVm,
}

/// Scripted responses and recorded calls for a single test.
#[derive(Default)]
pub struct MockProxmoxClient {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    vms: HashMap<(String, u32), ObservedVm>,
    tasks: HashMap<String, TaskState>,
    reservable_memory: HashMap<String, u64>,
    templates: Vec<(VmRef, Vec<String>)>,
    next_vmid: u32,
    next_task_id: u64,
    calls: Vec<String>,
}

impl MockProxmoxClient {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockState {
                next_vmid: 100,
                ..Default::default()
            }),
        }
    }

    pub fn with_reservable_memory(self, node: &str, bytes: u64) -> Self {
        self.inner
            .lock()
            .unwrap()
            .reservable_memory
            .insert(node.to_string(), bytes);
        self
    }

    pub fn with_template(self, vm: VmRef, tags: Vec<String>) -> Self {
        self.inner.lock().unwrap().templates.push((vm, tags));
        self
    }

    pub fn seed_vm(&self, observed: ObservedVm) {
        let mut state = self.inner.lock().unwrap();
        state.vms.insert((observed.node.clone(), observed.vmid), observed);
    }

    pub fn set_task_state(&self, upid: &str, state: TaskState) {
        self.inner.lock().unwrap().tasks.insert(upid.to_string(), state);
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn record(&self, state: &mut MockState, call: impl Into<String>) {
        state.calls.push(call.into());
    }

    fn new_task(&self, state: &mut MockState, node: &str) -> TaskRef {
        state.next_task_id += 1;
        let upid = format!("UPID:{node}:task{}", state.next_task_id);
        state.tasks.insert(upid.clone(), TaskState::Success);
        TaskRef {
            node: node.to_string(),
            upid,
        }
    }
}

#[async_trait]
impl ProxmoxClient for MockProxmoxClient {
    async fn clone(&self, request: CloneRequest) -> Result<TaskRef> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("clone({})", request.target_vmid));
        let vmid = request.target_vmid;
        let node = request.target_node.clone();
        state.vms.insert(
            (node.clone(), vmid),
            ObservedVm {
                vmid,
                node: node.clone(),
                name: request.name,
                firmware_uuid: None,
                power_state: PowerState::Stopped,
                sockets: 1,
                cores: 1,
                memory_mib: 0,
                tags: Vec::new(),
                interfaces: Vec::new(),
            },
        );
        Ok(self.new_task(&mut state, &node))
    }

    async fn configure(&self, vm: &VmRef, request: ConfigureRequest) -> Result<TaskRef> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("configure({})", vm.vmid));
        if let Some(observed) = state.vms.get_mut(&(vm.node.clone(), vm.vmid)) {
            if let Some(tags) = request.tags {
                observed.tags = tags;
            }
            if let Some(sockets) = request.sockets {
                observed.sockets = sockets;
            }
            if let Some(cores) = request.cores {
                observed.cores = cores;
            }
            if let Some(memory_mib) = request.memory_mib {
                observed.memory_mib = memory_mib;
            }
            for (device, cfg) in request.interfaces {
                observed.interfaces.retain(|(d, _)| d != &device);
                observed.interfaces.push((device, cfg));
            }
        }
        Ok(self.new_task(&mut state, &vm.node))
    }

    async fn resize_disk(&self, vm: &VmRef, _disk: &str, _size_gib: u64) -> Result<TaskRef> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("resize_disk({})", vm.vmid));
        Ok(self.new_task(&mut state, &vm.node))
    }

    async fn start(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("start({})", vm.vmid));
        if let Some(observed) = state.vms.get_mut(&(vm.node.clone(), vm.vmid)) {
            observed.power_state = PowerState::Running;
        }
        Ok(self.new_task(&mut state, &vm.node))
    }

    async fn resume(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("resume({})", vm.vmid));
        if let Some(observed) = state.vms.get_mut(&(vm.node.clone(), vm.vmid)) {
            observed.power_state = PowerState::Running;
        }
        Ok(self.new_task(&mut state, &vm.node))
    }

    async fn tag(&self, vm: &VmRef, tags: &[String]) -> Result<TaskRef> {
        self.configure(
            vm,
            ConfigureRequest {
                tags: Some(tags.to_vec()),
                ..Default::default()
            },
        )
        .await
    }

    async fn delete(&self, vm: &VmRef) -> Result<TaskRef> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("delete({})", vm.vmid));
        state.vms.remove(&(vm.node.clone(), vm.vmid));
        Ok(self.new_task(&mut state, &vm.node))
    }

    async fn get_vm(&self, vm: &VmRef) -> Result<ObservedVm> {
        let state = self.inner.lock().unwrap();
        state
            .vms
            .get(&(vm.node.clone(), vm.vmid))
            .cloned()
            .ok_or_else(|| Error::VmNotFound(vm.vmid, vm.node.clone()))
    }

    async fn find_vm_resource(&self, vmid: u32) -> Result<Option<VmRef>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .vms
            .values()
            .find(|v| v.vmid == vmid)
            .map(|v| VmRef {
                node: v.node.clone(),
                vmid: v.vmid,
            }))
    }

    async fn find_vm_template_by_tags(
        &self,
        tags: &[String],
        allowed_nodes: &[String],
    ) -> Result<Option<VmRef>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .templates
            .iter()
            .find(|(vm, template_tags)| {
                (allowed_nodes.is_empty() || allowed_nodes.contains(&vm.node))
                    && tags.iter().all(|t| template_tags.contains(t))
            })
            .map(|(vm, _)| vm.clone()))
    }

    async fn check_id(&self, vmid: u32) -> Result<bool> {
        let state = self.inner.lock().unwrap();
        Ok(!state.vms.values().any(|v| v.vmid == vmid))
    }

    async fn next_id(&self, range: Option<(u32, u32)>) -> Result<u32> {
        let mut state = self.inner.lock().unwrap();
        let mut candidate = state.next_vmid;
        loop {
            let in_range = range.is_none_or(|(low, high)| candidate >= low && candidate <= high);
            let taken = state.vms.values().any(|v| v.vmid == candidate);
            if in_range && !taken {
                state.next_vmid = candidate + 1;
                return Ok(candidate);
            }
            candidate += 1;
        }
    }

    async fn get_task(&self, task: &TaskRef) -> Result<TaskState> {
        let state = self.inner.lock().unwrap();
        state
            .tasks
            .get(&task.upid)
            .copied()
            .ok_or_else(|| Error::TaskNotFound(task.upid.clone()))
    }

    async fn get_reservable_memory_bytes(&self, node: &str) -> Result<u64> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("get_reservable_memory_bytes({node})"));
        Ok(state.reservable_memory.get(node).copied().unwrap_or(0))
    }

    async fn attach_cloud_init_iso(&self, vm: &VmRef, iso_bytes: Vec<u8>) -> Result<TaskRef> {
        let mut state = self.inner.lock().unwrap();
        self.record(
            &mut state,
            format!("attach_cloud_init_iso({}, {} bytes)", vm.vmid, iso_bytes.len()),
        );
        Ok(self.new_task(&mut state, &vm.node))
    }

    async fn unmount_cloud_init_iso(&self, vm: &VmRef) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        self.record(&mut state, format!("unmount_cloud_init_iso({})", vm.vmid));
        Ok(())
    }

    async fn cloud_init_status(&self, _vm: &VmRef) -> Result<CloudInitStatus> {
        Ok(CloudInitStatus::Done)
    }

    async fn qemu_agent_status(&self, _vm: &VmRef) -> Result<QemuAgentStatus> {
        Ok(QemuAgentStatus::Ready)
    }
}

impl Default for ObservedVm {
    fn default() -> Self {
        Self {
            vmid: 0,
            node: String::new(),
            name: String::new(),
            firmware_uuid: None,
            power_state: PowerState::Stopped,
            sockets: 1,
            cores: 1,
            memory_mib: 0,
            tags: Vec::new(),
            interfaces: Vec::new(),
        }
    }
}
