//! Top-level dispatch: resolve a [`RenderInput`] into a virtual ISO image
//! ready for the machine state machine to attach as the VM's `ide2` disk.

use crate::cloudinit::{render_instance_metadata, render_network_config_v2};
use crate::error::Result;
use crate::ignition::render_ignition;
use crate::iso::build_iso;
use crate::types::{BootstrapFormat, RenderInput};

/// Render the bootstrap ISO for `input`. Calling this twice with identical
/// inputs produces byte-identical output, since nothing timestamp-dependent
/// is embedded.
pub fn render_bootstrap_iso(input: &RenderInput) -> Result<Vec<u8>> {
    match input.format {
        BootstrapFormat::CloudConfig => render_cloud_config_iso(input),
        BootstrapFormat::Ignition => render_ignition_iso(input),
    }
}

fn render_cloud_config_iso(input: &RenderInput) -> Result<Vec<u8>> {
    let network_config = render_network_config_v2(&input.interfaces)?;
    let instance_metadata = render_instance_metadata(
        &input.firmware_uuid,
        &input.hostname,
        &input.provider_id,
        input.zone.as_deref(),
        input.primary_ip.as_deref(),
    )?;
    let user_data = if input.raw_payload.is_empty() {
        b"#cloud-config\n{}\n".to_vec()
    } else {
        input.raw_payload.clone()
    };
    let files = vec![
        ("user-data".to_string(), user_data),
        ("meta-data".to_string(), instance_metadata.into_bytes()),
        ("network-config".to_string(), network_config.into_bytes()),
    ];
    build_iso("cidata", &files)
}

fn render_ignition_iso(input: &RenderInput) -> Result<Vec<u8>> {
    let ignition = render_ignition(
        &input.raw_payload,
        &input.interfaces,
        &input.firmware_uuid,
        &input.hostname,
        &input.provider_id,
        input.zone.as_deref(),
        input.primary_ip.as_deref(),
    )?;
    build_iso("ignition", &[("config.ign".to_string(), ignition)])
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::IpConfig;

    fn input(format: BootstrapFormat) -> RenderInput {
        RenderInput {
            format,
            interfaces: vec![crate::types::ResolvedInterface {
                guest_name: "eth0".into(),
                proxmox_name: "net0".into(),
                mac: "AA:BB:CC:DD:EE:FF".into(),
                ip_configs: vec![IpConfig {
                    address: "10.10.10.5".into(),
                    prefix: 24,
                    gateway: Some("10.10.10.1".into()),
                    metric: None,
                }],
                dns_servers: vec!["1.1.1.1".into()],
                mtu: None,
                routes: Vec::new(),
                policy_rules: Vec::new(),
                vrf: None,
            }],
            firmware_uuid: "11111111-2222-3333-4444-555555555555".into(),
            hostname: "worker-0".into(),
            provider_id: "proxmox://11111111-2222-3333-4444-555555555555".into(),
            zone: None,
            primary_ip: Some("10.10.10.5".into()),
            raw_payload: Vec::new(),
        }
    }

    #[test]
    fn renders_cloud_config_iso_deterministically() {
        let a = render_bootstrap_iso(&input(BootstrapFormat::CloudConfig)).unwrap();
        let b = render_bootstrap_iso(&input(BootstrapFormat::CloudConfig)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn renders_ignition_iso_deterministically() {
        let a = render_bootstrap_iso(&input(BootstrapFormat::Ignition)).unwrap();
        let b = render_bootstrap_iso(&input(BootstrapFormat::Ignition)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn empty_interfaces_fail_cloud_config_rendering() {
        let mut req = input(BootstrapFormat::CloudConfig);
        req.interfaces.clear();
        assert!(render_bootstrap_iso(&req).is_err());
    }
}
