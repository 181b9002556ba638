//! Diffs the machine's declared sizing/network config against the observed
//! VM and produces the minimal `ConfigureRequest`/disk-resize calls needed to
//! converge, per §4.1 state `WaitingForDiskReconciliation` and its
//! config-diff-before-mutate rule: never issue a configure call that would be
//! a no-op.

use crate::crd::{BootDisk, NetworkDevice, ProxmoxMachineSpec};

use proxmox_client::types::{ConfigureRequest, NetworkInterfaceConfig, ObservedVm};

/// Whether any declared attribute differs from what the hypervisor reports.
#[must_use]
pub fn diff(spec: &ProxmoxMachineSpec, observed: &ObservedVm) -> Option<ConfigureRequest> {
    let mut request = ConfigureRequest::default();
    let mut changed = false;

    if spec.sockets != observed.sockets {
        request.sockets = Some(spec.sockets);
        changed = true;
    }
    if spec.cores != observed.cores {
        request.cores = Some(spec.cores);
        changed = true;
    }
    if spec.memory_mib != observed.memory_mib {
        request.memory_mib = Some(spec.memory_mib);
        changed = true;
    }

    if !spec.tags.is_empty() && spec.tags.iter().collect::<std::collections::HashSet<_>>()
        != observed.tags.iter().collect::<std::collections::HashSet<_>>()
    {
        request.tags = Some(spec.tags.clone());
        changed = true;
    }

    if let Some(description) = &spec.description {
        request.description = Some(description.clone());
        changed = true;
    }

    for (idx, device) in spec.network.iter().enumerate() {
        let device_name = device.name.clone().unwrap_or_else(|| format!("net{idx}"));
        let desired = desired_interface_config(device);
        let matches_observed = observed.interfaces.iter().any(|(name, cfg)| {
            name == &device_name
                && cfg.model == desired.model
                && cfg.bridge == desired.bridge
                && cfg.mtu == desired.mtu
                && cfg.tag == desired.tag
        });
        if !matches_observed {
            request.interfaces.push((device_name, desired));
            changed = true;
        }
    }

    changed.then_some(request)
}

fn desired_interface_config(device: &NetworkDevice) -> NetworkInterfaceConfig {
    NetworkInterfaceConfig {
        model: device.model.clone(),
        // the MAC is hypervisor-assigned on first clone and never declared;
        // comparisons against `observed` only ever look at bridge/mtu/tag.
        mac: String::new(),
        bridge: device.bridge.clone(),
        mtu: device.mtu,
        tag: device.vlan_tag,
    }
}

/// Whether the declared boot-disk size exceeds the observed disk and a
/// resize call should be issued. Resizing only ever grows a disk; a
/// declared size at or below the current one is a no-op (§4.1 idempotence
/// rule), modeled here as "caller tracks the last size it resized to".
#[must_use]
pub fn needs_resize(boot_disk: &BootDisk, last_resized_to_gib: Option<u64>) -> bool {
    last_resized_to_gib.is_none_or(|last| boot_disk.size_gib > last)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resize_is_skipped_once_applied_at_the_declared_size() {
        let disk = BootDisk {
            size_gib: 20,
            storage: None,
            disk: None,
        };
        assert!(needs_resize(&disk, None));
        assert!(!needs_resize(&disk, Some(20)));
        assert!(!needs_resize(&disk, Some(30)));
    }

    #[test]
    fn grown_declared_size_triggers_another_resize() {
        let disk = BootDisk {
            size_gib: 40,
            storage: None,
            disk: None,
        };
        assert!(needs_resize(&disk, Some(20)));
    }

    #[test]
    fn disk_key_defaults_to_scsi0() {
        let disk = BootDisk {
            size_gib: 20,
            storage: None,
            disk: None,
        };
        assert_eq!(disk.disk_key(), "scsi0");
    }
}
