//! Assembles a [`proxmox_bootstrap::RenderInput`] from this machine's
//! resolved addresses and observed VM, renders the ISO, and attaches it
//! (§4.6, state `WaitingForBootstrapDataReconciliation`).

use crate::addressing::InterfaceAddresses;
use crate::crd::{NetworkDevice, ProxmoxMachine};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use proxmox_bootstrap::{BootstrapFormat, IpConfig, PolicyRule, RenderInput, ResolvedInterface, Route};
use proxmox_client::client::ProxmoxClient;
use proxmox_client::types::{ObservedVm, VmRef};
use proxmox_operator::error::{Error, Result};

use kube::{Api, Client, ResourceExt};

const BOOTSTRAP_FORMAT_KEY: &str = "format";
const BOOTSTRAP_VALUE_KEY: &str = "value";

/// Fetch and parse the bootstrap secret's `format`/`value` keys (§6).
pub async fn read_bootstrap_secret(client: Client, namespace: &str, name: &str) -> Result<(BootstrapFormat, Vec<u8>)> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let secret = api
        .get(name)
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to get bootstrap secret {namespace}/{name}"), Box::new(e))))?;
    let data = secret.data.unwrap_or_default();

    let format = data
        .get(BOOTSTRAP_FORMAT_KEY)
        .and_then(|v| std::str::from_utf8(&v.0).ok())
        .map(str::trim)
        .and_then(|s| match s {
            "ignition" => Some(BootstrapFormat::Ignition),
            "cloud-config" => Some(BootstrapFormat::CloudConfig),
            _ => None,
        })
        .unwrap_or_default();

    let value = data.get(BOOTSTRAP_VALUE_KEY).map(|v| v.0.clone()).unwrap_or_default();
    Ok((format, value))
}

/// Build the renderer input from a machine's declared network devices, the
/// addresses resolved for each, and the VM's observed MAC addresses.
#[must_use]
pub fn build_render_input(
    machine: &ProxmoxMachine,
    addresses: &BTreeMap<String, InterfaceAddresses>,
    observed: &ObservedVm,
    format: BootstrapFormat,
    raw_payload: Vec<u8>,
    firmware_uuid: &str,
    provider_id: &str,
) -> RenderInput {
    let interfaces = machine
        .spec
        .network
        .iter()
        .enumerate()
        .filter_map(|(idx, device)| resolve_interface(idx, device, addresses, observed))
        .collect::<Vec<_>>();

    let primary_ip = interfaces
        .first()
        .and_then(|iface: &ResolvedInterface| iface.ip_configs.first())
        .map(|cfg| cfg.address.clone());

    RenderInput {
        format,
        interfaces,
        firmware_uuid: firmware_uuid.to_string(),
        hostname: machine.name_any(),
        provider_id: provider_id.to_string(),
        zone: None,
        primary_ip,
        raw_payload,
    }
}

fn resolve_interface(
    idx: usize,
    device: &NetworkDevice,
    addresses: &BTreeMap<String, InterfaceAddresses>,
    observed: &ObservedVm,
) -> Option<ResolvedInterface> {
    let proxmox_name = device.name.clone().unwrap_or_else(|| format!("net{idx}"));
    let guest_name = guest_name_of(&proxmox_name);
    let mac = observed
        .interfaces
        .iter()
        .find(|(name, _)| name == &proxmox_name)
        .map(|(_, cfg)| cfg.mac.clone())?;
    let resolved = addresses.get(&proxmox_name)?;

    Some(ResolvedInterface {
        guest_name,
        proxmox_name,
        mac,
        ip_configs: resolved
            .iter()
            .map(|a| IpConfig {
                address: a.address.clone(),
                prefix: a.prefix,
                gateway: a.gateway.clone(),
                metric: a.metric,
            })
            .collect(),
        dns_servers: device.dns_servers.clone(),
        mtu: device.mtu,
        routes: device
            .routes
            .iter()
            .map(|r| Route {
                to: r.to.clone(),
                via: r.via.clone(),
                metric: r.metric,
                table: r.table,
            })
            .collect(),
        policy_rules: device
            .policy_rules
            .iter()
            .map(|p| PolicyRule {
                from: p.from.clone(),
                to: p.to.clone(),
                table: p.table,
                priority: p.priority,
            })
            .collect(),
        vrf: None,
    })
}

/// `net{N}` -> `eth{N}`; no further inference (§9 Design Note, "do not infer
/// intent beyond that").
#[must_use]
pub fn guest_name_of(proxmox_name: &str) -> String {
    proxmox_name
        .strip_prefix("net")
        .map(|suffix| format!("eth{suffix}"))
        .unwrap_or_else(|| proxmox_name.to_string())
}

pub async fn attach(client: &dyn ProxmoxClient, vm: &VmRef, iso_bytes: Vec<u8>) -> Result<proxmox_client::types::TaskRef> {
    client.attach_cloud_init_iso(vm, iso_bytes).await.map_err(Error::Proxmox)
}

pub async fn unmount(client: &dyn ProxmoxClient, vm: &VmRef) -> Result<()> {
    client.unmount_cloud_init_iso(vm).await.map_err(Error::Proxmox)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guest_name_renames_net_to_eth() {
        assert_eq!(guest_name_of("net0"), "eth0");
        assert_eq!(guest_name_of("net12"), "eth12");
    }

    #[test]
    fn non_net_device_name_passes_through_unchanged() {
        assert_eq!(guest_name_of("vrf0"), "vrf0");
    }
}
