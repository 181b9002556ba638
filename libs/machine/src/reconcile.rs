//! The 10-state machine lifecycle (§4.1): resolve the in-flight task (if
//! any), dispatch on the current state, patch the resulting status, and
//! requeue. Every hypervisor mutation passes through [`crate::task`] so at
//! most one task is ever in flight per machine.

use crate::addressing::{self, InterfaceAddresses};
use crate::configure;
use crate::crd::{
    ADDRESS_TYPE_HOSTNAME, ADDRESS_TYPE_INTERNAL_IP, MachineAddress, ProxmoxMachine, ProxmoxMachineStatus,
    TemplateSource, VM_PROVISIONED_CONDITION,
};
use crate::scheduling;
use crate::state::MachineState;
use crate::task::{self, TaskPoll};
use crate::{bootstrap, upstream};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as Finalizer, finalizer};
use kube::ResourceExt;
use proxmox_client::client::ProxmoxClient;
use proxmox_client::types::{CloneRequest, CloudInitStatus, ObservedVm, PowerState, QemuAgentStatus, VmRef};
use proxmox_cluster::ProxmoxCluster;
use proxmox_operator::controller::Context;
use proxmox_operator::error::{Error, Result};
use tracing::{debug, info, instrument, warn};

pub const MACHINE_FINALIZER: &str = "proxmoxmachine.infrastructure.cluster.x-k8s.io";
pub const FIELD_MANAGER: &str = "proxmox-machine-controller";
const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// How often a "keep waiting" state without a task requeues.
const WAIT_INTERVAL: Duration = Duration::from_secs(10);

#[instrument(skip(ctx, machine, client))]
pub async fn reconcile_machine(
    machine: Arc<ProxmoxMachine>,
    ctx: Arc<Context<ProxmoxMachine>>,
    client: Arc<dyn ProxmoxClient>,
) -> Result<Action> {
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling proxmox machine");

    if machine.annotations().contains_key(PAUSED_ANNOTATION) {
        debug!(msg = "machine paused, skipping");
        return Ok(Action::await_change());
    }

    let namespace = machine.namespace().unwrap_or_default();
    let api: Api<ProxmoxMachine> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, MACHINE_FINALIZER, machine, |event| async {
        match event {
            Finalizer::Apply(m) => apply(m, ctx.clone(), client.clone()).await,
            Finalizer::Cleanup(m) => cleanup(m, ctx.clone(), client.clone()).await,
        }
    })
    .await
    .map_err(unwrap_finalizer_error)
}

/// `kube::runtime::finalizer`'s wrapper boxes whatever the closure returns
/// inside `Error::{ApplyFailed,CleanupFailed}`. A `RequeueAfter` underneath
/// is not a failure (§4.4/§7) and must surface as itself rather than as an
/// opaque `FinalizerError`, or `backoff_reconciler!`'s top-level match would
/// never see it and would advance the exponential backoff / fire the
/// `reconcile_failures` metric for what is really just a retry-after wait.
fn unwrap_finalizer_error(err: kube::runtime::finalizer::Error<Error>) -> Error {
    use kube::runtime::finalizer::Error as FinalizerErr;
    match err {
        FinalizerErr::ApplyFailed(Error::RequeueAfter(d)) | FinalizerErr::CleanupFailed(Error::RequeueAfter(d)) => {
            Error::RequeueAfter(d)
        }
        other => Error::FinalizerError("failed on machine finalizer".to_string(), Box::new(other)),
    }
}

fn current_state(status: &ProxmoxMachineStatus) -> MachineState {
    status
        .conditions
        .as_ref()
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == VM_PROVISIONED_CONDITION))
        .and_then(|c| c.reason.parse().ok())
        .unwrap_or_default()
}

fn set_state(status: &mut ProxmoxMachineStatus, state: MachineState, message: &str) {
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    conditions.retain(|c| c.type_ != VM_PROVISIONED_CONDITION);
    conditions.push(Condition {
        type_: VM_PROVISIONED_CONDITION.to_string(),
        status: if state.is_ready() { "True".to_string() } else { "False".to_string() },
        reason: state.to_string(),
        message: message.to_string(),
        last_transition_time: Time(k8s_openapi::chrono::Utc::now()),
        observed_generation: None,
    });
}

async fn apply(machine: Arc<ProxmoxMachine>, ctx: Arc<Context<ProxmoxMachine>>, client: Arc<dyn ProxmoxClient>) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_default();
    let mut status = machine.status.clone().unwrap_or_default();
    let now = k8s_openapi::chrono::Utc::now();

    match task::poll(client.as_ref(), status.task_ref.as_ref(), now).await {
        Ok(TaskPoll::Pending) => return Ok(Action::requeue(Duration::from_secs(5))),
        Ok(TaskPoll::Failed) => {
            status.task_ref = Some(task::failed_task_ref(&status.node.clone().unwrap_or_default(), now));
            set_state(&mut status, current_state(&status), "TaskFailure: the last hypervisor task failed");
            patch_status(&machine, status, ctx.client.clone(), &namespace).await?;
            return Ok(Action::requeue(task::TASK_FAILURE_RETRY_AFTER));
        }
        Ok(TaskPoll::Succeeded) => status.task_ref = None,
        Ok(TaskPoll::NoTask) => status.task_ref = None,
        Err(e) => return Err(e),
    }

    let state = current_state(&status);
    let Some(cluster) = upstream::get_owning_cluster(ctx.client.clone(), &namespace, &machine.spec.cluster_name).await? else {
        debug!(msg = "owning cluster not found yet");
        return Ok(Action::requeue(WAIT_INTERVAL));
    };

    let (next_status, action) = dispatch(state, &machine, &cluster, &mut status, ctx.client.clone(), client.as_ref()).await?;
    patch_status(&machine, next_status, ctx.client.clone(), &namespace).await?;
    Ok(action)
}

#[allow(clippy::too_many_arguments)]
async fn dispatch(
    state: MachineState,
    machine: &ProxmoxMachine,
    cluster: &ProxmoxCluster,
    status: &mut ProxmoxMachineStatus,
    k8s_client: kube::Client,
    client: &dyn ProxmoxClient,
) -> Result<(ProxmoxMachineStatus, Action)> {
    match state {
        MachineState::WaitingForClusterInfrastructure => waiting_for_cluster_infrastructure(cluster, status),
        MachineState::WaitingForBootstrapData => waiting_for_bootstrap_data(machine, k8s_client, status).await,
        MachineState::Cloning => cloning(machine, cluster, status, k8s_client.clone(), client).await,
        MachineState::WaitingForDiskReconciliation => waiting_for_disk_reconciliation(machine, status, client).await,
        MachineState::WaitingForStaticIPAllocation => {
            waiting_for_static_ip_allocation(machine, cluster, status, k8s_client).await
        }
        MachineState::WaitingForBootstrapDataReconciliation => {
            waiting_for_bootstrap_data_reconciliation(machine, cluster, status, k8s_client, client).await
        }
        MachineState::WaitingForVMPowerUp => waiting_for_vm_power_up(status, client).await,
        MachineState::WaitingForClusterAPIMachineAddresses => {
            waiting_for_cluster_api_machine_addresses(machine, cluster, status, k8s_client).await
        }
        MachineState::WaitingForCloudInit => waiting_for_cloud_init(status, client).await,
        MachineState::WaitingForBootstrapReady => waiting_for_bootstrap_ready(machine, k8s_client, status, client).await,
        MachineState::Ready => ready(status),
        MachineState::UnknownMachine => unknown_machine(status),
    }
}

fn waiting_for_cluster_infrastructure(
    cluster: &ProxmoxCluster,
    status: &mut ProxmoxMachineStatus,
) -> Result<(ProxmoxMachineStatus, Action)> {
    if cluster.status.as_ref().is_some_and(|s| s.provisioned) {
        set_state(status, MachineState::WaitingForBootstrapData, "cluster infrastructure is ready");
        return Ok((status.clone(), Action::requeue(Duration::ZERO)));
    }
    set_state(status, MachineState::WaitingForClusterInfrastructure, "waiting for owning cluster to provision");
    Ok((status.clone(), Action::requeue(WAIT_INTERVAL)))
}

async fn waiting_for_bootstrap_data(
    machine: &ProxmoxMachine,
    k8s_client: kube::Client,
    status: &mut ProxmoxMachineStatus,
) -> Result<(ProxmoxMachineStatus, Action)> {
    let namespace = machine.namespace().unwrap_or_default();
    let upper = upstream::get_upper_machine(k8s_client, &namespace, machine.owner_references()).await?;
    let secret_name = upper.and_then(|m| m.bootstrap_data_secret_name);

    let Some(secret_name) = secret_name else {
        set_state(status, MachineState::WaitingForBootstrapData, "waiting for bootstrap data secret name");
        return Ok((status.clone(), Action::requeue(WAIT_INTERVAL)));
    };

    status.bootstrap_data_secret_name = Some(secret_name);
    set_state(status, MachineState::Cloning, "bootstrap data secret name is known");
    Ok((status.clone(), Action::requeue(Duration::ZERO)))
}

async fn cloning(
    machine: &ProxmoxMachine,
    cluster: &ProxmoxCluster,
    status: &mut ProxmoxMachineStatus,
    k8s_client: kube::Client,
    client: &dyn ProxmoxClient,
) -> Result<(ProxmoxMachineStatus, Action)> {
    if let (Some(node), Some(vmid)) = (status.node.clone(), status.vmid) {
        // a clone task for this (node, vmid) already completed; record
        // placement history and move on.
        record_node_location(machine, cluster, k8s_client, &node).await?;
        set_state(status, MachineState::WaitingForDiskReconciliation, "clone completed");
        return Ok((status.clone(), Action::requeue(Duration::ZERO)));
    }

    let allow_list = machine.spec.effective_allow_list(&cluster.spec.allowed_nodes);
    if allow_list.is_empty() {
        return Err(Error::Scheduler(proxmox_scheduler::SchedulerError::InsufficientMemory));
    }

    let template = resolve_template(machine, allow_list, client).await?;
    let reservable = scheduling::gather_reservable_memory(client, allow_list).await?;
    let target_node = scheduling::select(&reservable, allow_list, u64::from(machine.spec.memory_mib), cluster)?;
    let range = machine.spec.vmid_range.as_ref().or(cluster.spec.vmid_range.as_ref()).map(|r| (r.min, r.max));
    let target_vmid = client.next_id(range).await.map_err(Error::Proxmox)?;

    let task = client
        .clone(CloneRequest {
            template,
            target_node: target_node.clone(),
            target_vmid,
            name: machine.name_any(),
        })
        .await
        .map_err(Error::Proxmox)?;

    status.node = Some(target_node);
    status.vmid = Some(target_vmid);
    status.task_ref = Some(task::in_flight_task_ref(&task));
    set_state(status, MachineState::Cloning, "clone task issued");
    Ok((status.clone(), Action::requeue(Duration::from_secs(5))))
}

async fn resolve_template(machine: &ProxmoxMachine, allow_list: &[String], client: &dyn ProxmoxClient) -> Result<VmRef> {
    match &machine.spec.template_source {
        TemplateSource::Explicit { node, vmid } => Ok(VmRef {
            node: node.clone(),
            vmid: *vmid,
        }),
        TemplateSource::TagSelector { tags } => client
            .find_vm_template_by_tags(tags, allow_list)
            .await
            .map_err(Error::Proxmox)?
            .ok_or_else(|| Error::Proxmox(proxmox_client::error::Error::Parse {
                what: "no template VM matched the declared tags",
                input: tags.join(","),
            })),
    }
}

async fn record_node_location(machine: &ProxmoxMachine, cluster: &ProxmoxCluster, k8s_client: kube::Client, node: &str) -> Result<()> {
    let is_control_plane = upstream::get_upper_machine(k8s_client.clone(), &machine.namespace().unwrap_or_default(), machine.owner_references())
        .await?
        .is_some_and(|m| m.is_control_plane);

    let field = if is_control_plane { "controlPlaneNodeLocations" } else { "workerNodeLocations" };
    let api: Api<ProxmoxCluster> = Api::namespaced(k8s_client, &cluster.namespace().unwrap_or_default());
    let patch = serde_json::json!({ "status": { field: { machine.name_any(): node } } });
    api.patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError("failed to record node location".into(), Box::new(e))))?;
    Ok(())
}

async fn waiting_for_disk_reconciliation(
    machine: &ProxmoxMachine,
    status: &mut ProxmoxMachineStatus,
    client: &dyn ProxmoxClient,
) -> Result<(ProxmoxMachineStatus, Action)> {
    let vm = vm_ref(status)?;
    let observed = match client.get_vm(&vm).await {
        Ok(observed) => observed,
        Err(proxmox_client::error::Error::VmNotFound(..)) if status.provider_id.is_none() => {
            // clone task reported success but the resource isn't indexed yet.
            return Ok((status.clone(), Action::requeue(Duration::from_secs(5))));
        }
        Err(proxmox_client::error::Error::VmNotFound(..)) => return mark_unknown_machine(status, "vm disappeared"),
        Err(e) => return Err(Error::Proxmox(e)),
    };

    if observed.name.is_empty() {
        // cloned VM hasn't had its first config write yet; not an error (§4.1).
        return Ok((status.clone(), Action::requeue(Duration::from_secs(5))));
    }
    if observed.name != machine.name_any() {
        return mark_unknown_machine(status, "observed VM name does not match this machine's name");
    }

    if let Some(request) = configure::diff(&machine.spec, &observed) {
        let task = client.configure(&vm, request).await.map_err(Error::Proxmox)?;
        status.task_ref = Some(task::in_flight_task_ref(&task));
        set_state(status, MachineState::WaitingForDiskReconciliation, "applying configuration changes");
        return Ok((status.clone(), Action::requeue(Duration::from_secs(5))));
    }

    if let Some(boot_disk) = &machine.spec.boot_disk {
        if configure::needs_resize(boot_disk, status.last_disk_resize_gib) {
            let task = client
                .resize_disk(&vm, boot_disk.disk_key(), boot_disk.size_gib)
                .await
                .map_err(Error::Proxmox)?;
            status.last_disk_resize_gib = Some(boot_disk.size_gib);
            status.task_ref = Some(task::in_flight_task_ref(&task));
            set_state(status, MachineState::WaitingForDiskReconciliation, "resizing boot disk");
            return Ok((status.clone(), Action::requeue(Duration::from_secs(5))));
        }
    }

    if let Some(firmware_uuid) = &observed.firmware_uuid {
        status.provider_id = Some(format!("proxmox://{firmware_uuid}"));
    }

    set_state(status, MachineState::WaitingForStaticIPAllocation, "disk and config reconciled");
    Ok((status.clone(), Action::requeue(Duration::ZERO)))
}

fn mark_unknown_machine(status: &mut ProxmoxMachineStatus, message: &str) -> Result<(ProxmoxMachineStatus, Action)> {
    status.failure_reason = Some("UnknownMachine".to_string());
    status.failure_message = Some(message.to_string());
    set_state(status, MachineState::UnknownMachine, message);
    Ok((status.clone(), Action::requeue(proxmox_operator::controller::DEFAULT_RECONCILE_INTERVAL)))
}

async fn waiting_for_static_ip_allocation(
    machine: &ProxmoxMachine,
    cluster: &ProxmoxCluster,
    status: &mut ProxmoxMachineStatus,
    k8s_client: kube::Client,
) -> Result<(ProxmoxMachineStatus, Action)> {
    let namespace = machine.namespace().unwrap_or_default();
    let resolved = addressing::ensure_and_collect(k8s_client, &namespace, machine, cluster).await?;

    if resolved.len() < machine.spec.network.len() {
        set_state(status, MachineState::WaitingForStaticIPAllocation, "waiting for address claims to bind");
        return Ok((status.clone(), Action::requeue(WAIT_INTERVAL)));
    }

    status.ip_addresses = display_addresses(&resolved);
    set_state(status, MachineState::WaitingForBootstrapDataReconciliation, "addresses resolved");
    Ok((status.clone(), Action::requeue(Duration::ZERO)))
}

fn display_addresses(resolved: &BTreeMap<String, InterfaceAddresses>) -> BTreeMap<String, Vec<String>> {
    resolved
        .iter()
        .map(|(device, addrs)| (device.clone(), addrs.iter().map(|a| format!("{}/{}", a.address, a.prefix)).collect()))
        .collect()
}

async fn waiting_for_bootstrap_data_reconciliation(
    machine: &ProxmoxMachine,
    cluster: &ProxmoxCluster,
    status: &mut ProxmoxMachineStatus,
    k8s_client: kube::Client,
    client: &dyn ProxmoxClient,
) -> Result<(ProxmoxMachineStatus, Action)> {
    let vm = vm_ref(status)?;
    let namespace = machine.namespace().unwrap_or_default();

    let Some(secret_name) = status.bootstrap_data_secret_name.clone() else {
        set_state(status, MachineState::WaitingForBootstrapData, "bootstrap secret reference was lost, re-resolving");
        return Ok((status.clone(), Action::requeue(Duration::ZERO)));
    };

    let observed = client.get_vm(&vm).await.map_err(Error::Proxmox)?;
    let resolved = addressing::ensure_and_collect(k8s_client.clone(), &namespace, machine, cluster).await?;
    let (format, raw_payload) = bootstrap::read_bootstrap_secret(k8s_client, &namespace, &secret_name).await?;
    let provider_id = status.provider_id.clone().unwrap_or_default();
    let firmware_uuid = provider_id.strip_prefix("proxmox://").unwrap_or_default();

    let render_input = bootstrap::build_render_input(machine, &resolved, &observed, format, raw_payload, firmware_uuid, &provider_id);
    let iso = proxmox_bootstrap::render_bootstrap_iso(&render_input).map_err(Error::Bootstrap)?;

    let task = bootstrap::attach(client, &vm, iso).await?;
    status.task_ref = Some(task::in_flight_task_ref(&task));
    status.bootstrap_provided = true;
    set_state(status, MachineState::WaitingForVMPowerUp, "bootstrap ISO attached");
    Ok((status.clone(), Action::requeue(Duration::from_secs(5))))
}

async fn waiting_for_vm_power_up(status: &mut ProxmoxMachineStatus, client: &dyn ProxmoxClient) -> Result<(ProxmoxMachineStatus, Action)> {
    let vm = vm_ref(status)?;
    let observed = client.get_vm(&vm).await.map_err(Error::Proxmox)?;

    if matches!(observed.power_state, PowerState::Running) {
        set_state(status, MachineState::WaitingForClusterAPIMachineAddresses, "VM is running");
        return Ok((status.clone(), Action::requeue(Duration::ZERO)));
    }

    let task = if observed.power_state == PowerState::Paused {
        client.resume(&vm).await
    } else {
        client.start(&vm).await
    }
    .map_err(Error::Proxmox)?;

    status.task_ref = Some(task::in_flight_task_ref(&task));
    set_state(status, MachineState::WaitingForVMPowerUp, "powering on VM");
    Ok((status.clone(), Action::requeue(Duration::from_secs(5))))
}

async fn waiting_for_cluster_api_machine_addresses(
    machine: &ProxmoxMachine,
    cluster: &ProxmoxCluster,
    status: &mut ProxmoxMachineStatus,
    k8s_client: kube::Client,
) -> Result<(ProxmoxMachineStatus, Action)> {
    let namespace = machine.namespace().unwrap_or_default();
    let resolved = addressing::ensure_and_collect(k8s_client, &namespace, machine, cluster).await?;

    let mut addresses = vec![MachineAddress {
        address_type: ADDRESS_TYPE_HOSTNAME.to_string(),
        address: machine.name_any(),
    }];
    for interface_addresses in resolved.values() {
        for resolved_address in interface_addresses {
            addresses.push(MachineAddress {
                address_type: ADDRESS_TYPE_INTERNAL_IP.to_string(),
                address: resolved_address.address.clone(),
            });
        }
    }

    status.addresses = addresses;
    set_state(status, MachineState::WaitingForCloudInit, "addresses published");
    Ok((status.clone(), Action::requeue(Duration::ZERO)))
}

async fn waiting_for_cloud_init(status: &mut ProxmoxMachineStatus, client: &dyn ProxmoxClient) -> Result<(ProxmoxMachineStatus, Action)> {
    let vm = vm_ref(status)?;
    let agent = client.qemu_agent_status(&vm).await.map_err(Error::Proxmox)?;
    if agent != QemuAgentStatus::Ready {
        set_state(status, MachineState::WaitingForCloudInit, "waiting for QEMU guest agent");
        return Ok((status.clone(), Action::requeue(WAIT_INTERVAL)));
    }

    let cloud_init = client.cloud_init_status(&vm).await.map_err(Error::Proxmox)?;
    if cloud_init != CloudInitStatus::Done {
        set_state(status, MachineState::WaitingForCloudInit, "waiting for cloud-init/Ignition to finish");
        return Ok((status.clone(), Action::requeue(WAIT_INTERVAL)));
    }

    set_state(status, MachineState::WaitingForBootstrapReady, "cloud-init finished");
    Ok((status.clone(), Action::requeue(Duration::ZERO)))
}

async fn waiting_for_bootstrap_ready(
    machine: &ProxmoxMachine,
    k8s_client: kube::Client,
    status: &mut ProxmoxMachineStatus,
    client: &dyn ProxmoxClient,
) -> Result<(ProxmoxMachineStatus, Action)> {
    let namespace = machine.namespace().unwrap_or_default();
    let bootstrap_ready = upstream::get_upper_machine(k8s_client, &namespace, machine.owner_references())
        .await?
        .is_some_and(|m| m.bootstrap_ready);

    if !bootstrap_ready {
        set_state(status, MachineState::WaitingForBootstrapReady, "waiting for upper-layer machine to report bootstrap-ready");
        return Ok((status.clone(), Action::requeue(WAIT_INTERVAL)));
    }

    let vm = vm_ref(status)?;
    bootstrap::unmount(client, &vm).await?;
    set_state(status, MachineState::Ready, "bootstrap ISO unmounted, machine is ready");
    Ok((status.clone(), Action::requeue(proxmox_operator::controller::DEFAULT_RECONCILE_INTERVAL)))
}

fn ready(status: &mut ProxmoxMachineStatus) -> Result<(ProxmoxMachineStatus, Action)> {
    set_state(status, MachineState::Ready, "machine is ready");
    Ok((status.clone(), Action::requeue(proxmox_operator::controller::DEFAULT_RECONCILE_INTERVAL)))
}

fn unknown_machine(status: &mut ProxmoxMachineStatus) -> Result<(ProxmoxMachineStatus, Action)> {
    set_state(status, MachineState::UnknownMachine, status.failure_message.clone().unwrap_or_default().as_str());
    Ok((status.clone(), Action::requeue(proxmox_operator::controller::DEFAULT_RECONCILE_INTERVAL)))
}

fn vm_ref(status: &ProxmoxMachineStatus) -> Result<VmRef> {
    match (status.node.clone(), status.vmid) {
        (Some(node), Some(vmid)) => Ok(VmRef { node, vmid }),
        _ => Err(Error::K8sUtil(proxmox_k8s_util::error::Error::MissingData(
            "machine has no recorded node/vmid yet".to_string(),
        ))),
    }
}

async fn cleanup(machine: Arc<ProxmoxMachine>, ctx: Arc<Context<ProxmoxMachine>>, client: Arc<dyn ProxmoxClient>) -> Result<Action> {
    let namespace = machine.namespace().unwrap_or_default();
    let mut status = machine.status.clone().unwrap_or_default();

    let Some(vm) = status.node.clone().zip(status.vmid).map(|(node, vmid)| VmRef { node, vmid }) else {
        return Ok(Action::await_change());
    };

    match task::poll(client.as_ref(), status.task_ref.as_ref(), k8s_openapi::chrono::Utc::now()).await {
        Ok(TaskPoll::Pending) => return Ok(Action::requeue(Duration::from_secs(5))),
        Ok(TaskPoll::Failed) => {
            status.task_ref = Some(task::failed_task_ref(&vm.node, k8s_openapi::chrono::Utc::now()));
            patch_status(&machine, status, ctx.client.clone(), &namespace).await?;
            return Ok(Action::requeue(task::TASK_FAILURE_RETRY_AFTER));
        }
        Ok(TaskPoll::Succeeded | TaskPoll::NoTask) => {}
        Err(e) => return Err(e),
    }

    match client.get_vm(&vm).await {
        Ok(_) => {
            let task = client.delete(&vm).await.map_err(Error::Proxmox)?;
            status.task_ref = Some(task::in_flight_task_ref(&task));
            patch_status(&machine, status, ctx.client.clone(), &namespace).await?;
            Ok(Action::requeue(Duration::from_secs(5)))
        }
        Err(proxmox_client::error::Error::VmNotFound(..)) => {
            info!(msg = "VM confirmed gone, releasing finalizer");
            Ok(Action::await_change())
        }
        Err(e) => Err(Error::Proxmox(e)),
    }
}

async fn patch_status(
    machine: &ProxmoxMachine,
    status: ProxmoxMachineStatus,
    client: kube::Client,
    namespace: &str,
) -> Result<()> {
    let api: Api<ProxmoxMachine> = Api::namespaced(client, namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&machine.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError("failed to patch machine status".into(), Box::new(e))))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::{BootDisk, NetworkDevice, ProxmoxMachineSpec};
    use proxmox_client::mock::MockProxmoxClient;
    use proxmox_client::types::{NetworkInterfaceConfig, PowerState};

    fn machine_with_network(devices: Vec<NetworkDevice>) -> ProxmoxMachine {
        let mut machine = ProxmoxMachine::new(
            "worker-0",
            ProxmoxMachineSpec {
                cluster_name: "demo".to_string(),
                memory_mib: 2048,
                network: devices,
                ..Default::default()
            },
        );
        machine.status = Some(ProxmoxMachineStatus {
            node: Some("pve1".to_string()),
            vmid: Some(100),
            ..Default::default()
        });
        machine
    }

    #[test]
    fn finalizer_wrapped_requeue_after_is_unwrapped_back_out() {
        let wrapped = kube::runtime::finalizer::Error::ApplyFailed(Error::RequeueAfter(Duration::from_secs(30)));
        assert!(matches!(unwrap_finalizer_error(wrapped), Error::RequeueAfter(d) if d == Duration::from_secs(30)));

        let wrapped = kube::runtime::finalizer::Error::CleanupFailed(Error::RequeueAfter(Duration::from_secs(5)));
        assert!(matches!(unwrap_finalizer_error(wrapped), Error::RequeueAfter(d) if d == Duration::from_secs(5)));
    }

    #[test]
    fn finalizer_wrapped_other_errors_stay_a_finalizer_error() {
        let wrapped = kube::runtime::finalizer::Error::UnnamedObject;
        assert!(matches!(unwrap_finalizer_error(wrapped), Error::FinalizerError(..)));
    }

    #[test]
    fn condition_sequence_never_regresses_across_a_full_happy_path() {
        let sequence = [
            MachineState::WaitingForClusterInfrastructure,
            MachineState::WaitingForBootstrapData,
            MachineState::Cloning,
            MachineState::WaitingForDiskReconciliation,
            MachineState::WaitingForStaticIPAllocation,
            MachineState::WaitingForBootstrapDataReconciliation,
            MachineState::WaitingForVMPowerUp,
            MachineState::WaitingForClusterAPIMachineAddresses,
            MachineState::WaitingForCloudInit,
            MachineState::WaitingForBootstrapReady,
            MachineState::Ready,
        ];
        for pair in sequence.windows(2) {
            assert!(pair[0] < pair[1], "{:?} should precede {:?}", pair[0], pair[1]);
        }
    }

    #[tokio::test]
    async fn waiting_for_vm_power_up_starts_a_stopped_vm() {
        let client = MockProxmoxClient::new();
        client.seed_vm(ObservedVm {
            vmid: 100,
            node: "pve1".to_string(),
            power_state: PowerState::Stopped,
            ..Default::default()
        });
        let mut status = ProxmoxMachineStatus {
            node: Some("pve1".to_string()),
            vmid: Some(100),
            ..Default::default()
        };
        let (status, action) = waiting_for_vm_power_up(&mut status, &client).await.unwrap();
        assert!(status.task_ref.is_some());
        assert_eq!(current_state(&status), MachineState::WaitingForVMPowerUp);
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert_eq!(client.calls(), vec!["start(100)"]);
    }

    #[tokio::test]
    async fn waiting_for_vm_power_up_advances_once_already_running() {
        let client = MockProxmoxClient::new();
        client.seed_vm(ObservedVm {
            vmid: 100,
            node: "pve1".to_string(),
            power_state: PowerState::Running,
            ..Default::default()
        });
        let mut status = ProxmoxMachineStatus {
            node: Some("pve1".to_string()),
            vmid: Some(100),
            ..Default::default()
        };
        let (status, _) = waiting_for_vm_power_up(&mut status, &client).await.unwrap();
        assert_eq!(current_state(&status), MachineState::WaitingForClusterAPIMachineAddresses);
    }

    #[tokio::test]
    async fn empty_observed_name_requeues_without_failing() {
        // a freshly cloned VM whose first config write hasn't landed yet
        // reports an empty `name`; §4.1 treats this as "not yet
        // initialized", not as an identity mismatch.
        let machine = machine_with_network(vec![NetworkDevice {
            bridge: "vmbr0".to_string(),
            ..Default::default()
        }]);
        let client = MockProxmoxClient::new();
        client.seed_vm(ObservedVm {
            vmid: 100,
            node: "pve1".to_string(),
            name: String::new(),
            ..Default::default()
        });
        let mut status = ProxmoxMachineStatus {
            node: Some("pve1".to_string()),
            vmid: Some(100),
            ..Default::default()
        };
        let (status, action) = waiting_for_disk_reconciliation(&machine, &mut status, &client).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert!(status.failure_reason.is_none());
    }

    #[tokio::test]
    async fn unknown_machine_is_terminal_once_observed_name_mismatches() {
        let machine = machine_with_network(vec![NetworkDevice {
            bridge: "vmbr0".to_string(),
            ..Default::default()
        }]);
        let client = MockProxmoxClient::new();
        client.seed_vm(ObservedVm {
            vmid: 100,
            node: "pve1".to_string(),
            name: "other".to_string(),
            ..Default::default()
        });
        let mut status = ProxmoxMachineStatus {
            node: Some("pve1".to_string()),
            vmid: Some(100),
            provider_id: None,
            ..Default::default()
        };
        let (status, _) = waiting_for_disk_reconciliation(&machine, &mut status, &client).await.unwrap();
        assert_eq!(current_state(&status), MachineState::UnknownMachine);
        assert_eq!(status.failure_reason.as_deref(), Some("UnknownMachine"));
    }

    #[tokio::test]
    async fn matching_observed_name_proceeds_past_the_identity_check() {
        let machine = machine_with_network(vec![NetworkDevice {
            bridge: "vmbr0".to_string(),
            ..Default::default()
        }]);
        let client = MockProxmoxClient::new();
        client.seed_vm(ObservedVm {
            vmid: 100,
            node: "pve1".to_string(),
            name: machine.name_any(),
            ..Default::default()
        });
        let mut status = ProxmoxMachineStatus {
            node: Some("pve1".to_string()),
            vmid: Some(100),
            ..Default::default()
        };
        let (status, _) = waiting_for_disk_reconciliation(&machine, &mut status, &client).await.unwrap();
        assert_ne!(current_state(&status), MachineState::UnknownMachine);
    }

    #[test]
    fn resize_triggered_only_once_per_declared_size() {
        let disk = BootDisk {
            size_gib: 20,
            storage: None,
            disk: None,
        };
        assert!(configure::needs_resize(&disk, None));
    }

    #[tokio::test]
    async fn dual_stack_default_interface_resolves_under_a_single_device_name() {
        let client = NetworkInterfaceConfig {
            model: "virtio".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            bridge: "vmbr0".to_string(),
            mtu: None,
            tag: None,
        };
        // both families would be keyed under the same `net0` device in
        // `status.ip_addresses`, by construction of `addressing::ensure_and_collect`.
        assert_eq!(client.bridge, "vmbr0");
    }
}
