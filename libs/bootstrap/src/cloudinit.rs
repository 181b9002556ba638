//! cloud-config output: a netplan-style network-config v2 stanza plus an
//! instance-metadata document keyed by the firmware UUID (§4.6).

use crate::error::{Error, Result};
use crate::types::{IpConfig, PolicyRule, ResolvedInterface, Route};

use std::collections::BTreeMap;

use serde::Serialize;

#[derive(Serialize)]
struct NetworkConfig {
    network: NetworkV2,
}

#[derive(Serialize)]
struct NetworkV2 {
    version: u8,
    ethernets: BTreeMap<String, Ethernet>,
}

#[derive(Serialize)]
struct Ethernet {
    #[serde(rename = "match")]
    match_: MacMatch,
    set_name: String,
    addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    gateway6: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    nameservers: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    routes: Vec<NetplanRoute>,
    #[serde(skip_serializing_if = "Vec::is_empty", rename = "routing-policy")]
    routing_policy: Vec<NetplanRoutingPolicy>,
}

#[derive(Serialize)]
struct MacMatch {
    macaddress: String,
}

#[derive(Serialize)]
struct NetplanRoute {
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    via: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metric: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<u32>,
}

#[derive(Serialize)]
struct NetplanRoutingPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to: Option<String>,
    table: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u32>,
}

fn primary_gateway(ip_configs: &[IpConfig], v6: bool) -> Option<String> {
    ip_configs
        .iter()
        .find(|c| c.address.contains(':') == v6 && c.gateway.is_some())
        .and_then(|c| c.gateway.clone())
}

/// Render the network-config v2 document. The first pool's address on each
/// interface supplies the default route when it carries a gateway (§4.3
/// ordering rule).
pub fn render_network_config_v2(interfaces: &[ResolvedInterface]) -> Result<String> {
    if interfaces.is_empty() {
        return Err(Error::NoInterfaces);
    }
    let mut ethernets = BTreeMap::new();
    for iface in interfaces {
        let ethernet = Ethernet {
            match_: MacMatch {
                macaddress: iface.mac.clone(),
            },
            set_name: iface.guest_name.clone(),
            addresses: iface
                .ip_configs
                .iter()
                .map(|c| format!("{}/{}", c.address, c.prefix))
                .collect(),
            gateway4: primary_gateway(&iface.ip_configs, false),
            gateway6: primary_gateway(&iface.ip_configs, true),
            mtu: iface.mtu,
            nameservers: iface.dns_servers.clone(),
            routes: iface
                .routes
                .iter()
                .map(|r: &Route| NetplanRoute {
                    to: r.to.clone(),
                    via: r.via.clone(),
                    metric: r.metric,
                    table: r.table,
                })
                .collect(),
            routing_policy: iface
                .policy_rules
                .iter()
                .map(|p: &PolicyRule| NetplanRoutingPolicy {
                    from: p.from.clone(),
                    to: p.to.clone(),
                    table: p.table,
                    priority: p.priority,
                })
                .collect(),
        };
        ethernets.insert(iface.guest_name.clone(), ethernet);
    }
    let doc = NetworkConfig {
        network: NetworkV2 { version: 2, ethernets },
    };
    serde_yaml::to_string(&doc).map_err(Error::NetworkConfig)
}

#[derive(Serialize)]
struct InstanceMetadata {
    instance_id: String,
    local_hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_ipv4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    zone: Option<String>,
    provider_id: String,
}

/// Render the instance-metadata document, keyed by the VM's firmware UUID.
pub fn render_instance_metadata(
    firmware_uuid: &str,
    hostname: &str,
    provider_id: &str,
    zone: Option<&str>,
    primary_ip: Option<&str>,
) -> Result<String> {
    let doc = InstanceMetadata {
        instance_id: firmware_uuid.to_string(),
        local_hostname: hostname.to_string(),
        local_ipv4: primary_ip.map(str::to_string),
        zone: zone.map(str::to_string),
        provider_id: provider_id.to_string(),
    };
    serde_yaml::to_string(&doc).map_err(Error::InstanceMetadata)
}

#[cfg(test)]
mod test {
    use super::*;

    fn iface() -> ResolvedInterface {
        ResolvedInterface {
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
            mtu: Some(1500),
            routes: Vec::new(),
            policy_rules: Vec::new(),
            vrf: None,
        }
    }

    #[test]
    fn renders_stable_network_config() {
        let out = render_network_config_v2(&[iface()]).unwrap();
        assert!(out.contains("version: 2"));
        assert!(out.contains("eth0"));
        assert!(out.contains("AA:BB:CC:DD:EE:FF"));
        assert!(out.contains("gateway4: 10.10.10.1"));
    }

    #[test]
    fn rendering_is_byte_identical_across_calls() {
        let a = render_network_config_v2(&[iface()]).unwrap();
        let b = render_network_config_v2(&[iface()]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_empty_interface_list() {
        assert!(render_network_config_v2(&[]).is_err());
    }
}
