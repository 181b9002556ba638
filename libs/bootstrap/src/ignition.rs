//! Ignition output: adds `/etc/hostname`, a `proxmox-env` file, one
//! systemd-networkd unit per interface, and enables `systemd-resolved`,
//! merged on top of the caller-supplied Ignition payload (§4.6).

use crate::error::{Error, Result};
use crate::types::ResolvedInterface;

use serde_json::{Value, json};

fn data_url(contents: &str) -> String {
    format!("data:,{}", urlencoding_minimal(contents))
}

/// Minimal percent-encoding sufficient for Ignition's `data:` URL scheme;
/// Ignition only requires escaping the handful of reserved characters, not a
/// full RFC 3986 implementation.
fn urlencoding_minimal(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn file_entry(path: &str, contents: &str, mode: u32) -> Value {
    json!({
        "path": path,
        "mode": mode,
        "contents": { "source": data_url(contents) },
        "overwrite": true,
    })
}

fn networkd_unit(iface: &ResolvedInterface) -> Value {
    let mut network = format!("[Match]\nMACAddress={}\n\n[Network]\n", iface.mac);
    for ip in &iface.ip_configs {
        network.push_str(&format!("Address={}/{}\n", ip.address, ip.prefix));
    }
    for dns in &iface.dns_servers {
        network.push_str(&format!("DNS={dns}\n"));
    }
    if let Some(vrf) = &iface.vrf {
        network.push_str(&format!("VRF={vrf}\n"));
    }
    if let Some(mtu) = iface.mtu {
        network.push_str(&format!("\n[Link]\nMTUBytes={mtu}\n"));
    }
    if !iface.routes.is_empty() {
        for route in &iface.routes {
            network.push_str("\n[Route]\n");
            network.push_str(&format!("Destination={}\n", route.to));
            if let Some(via) = &route.via {
                network.push_str(&format!("Gateway={via}\n"));
            }
            if let Some(metric) = route.metric {
                network.push_str(&format!("Metric={metric}\n"));
            }
            if let Some(table) = route.table {
                network.push_str(&format!("Table={table}\n"));
            }
        }
    }
    json!({
        "name": format!("10-{}.network", iface.guest_name),
        "contents": network,
    })
}

/// Parse the caller's Ignition payload and append the generated fragment:
/// hostname file, `proxmox-env`, one `.network` unit per interface, and a
/// `systemd-resolved.service` enablement.
pub fn render_ignition(
    raw_payload: &[u8],
    interfaces: &[ResolvedInterface],
    firmware_uuid: &str,
    hostname: &str,
    provider_id: &str,
    zone: Option<&str>,
    primary_ip: Option<&str>,
) -> Result<Vec<u8>> {
    let mut doc: Value = if raw_payload.is_empty() {
        json!({ "ignition": { "version": "3.4.0" } })
    } else {
        serde_json::from_slice(raw_payload).map_err(Error::IgnitionParse)?
    };

    let proxmox_env = format!(
        "HOSTNAME={hostname}\nZONE={zone}\nINSTANCE_ID={firmware_uuid}\nPROVIDER_ID={provider_id}\nPRIMARY_IP={primary_ip}\n",
        zone = zone.unwrap_or_default(),
        primary_ip = primary_ip.unwrap_or_default(),
    );

    let network_units: Vec<Value> = interfaces.iter().map(networkd_unit).collect();
    let networkd_storage_files: Vec<Value> = network_units
        .iter()
        .map(|u| {
            let name = u["name"].as_str().unwrap_or_default().to_string();
            let contents = u["contents"].as_str().unwrap_or_default().to_string();
            file_entry(&format!("/etc/systemd/network/{name}"), &contents, 0o644)
        })
        .collect();

    {
        let files = ignition_files_mut(&mut doc)?;
        files.push(file_entry("/etc/hostname", &format!("{hostname}\n"), 0o644));
        files.push(file_entry("/etc/proxmox-env", &proxmox_env, 0o644));
        files.extend(networkd_storage_files);
    }

    {
        let units = ignition_units_mut(&mut doc)?;
        units.push(json!({ "name": "systemd-resolved.service", "enabled": true }));
        units.push(json!({ "name": "systemd-networkd.service", "enabled": true }));
    }

    serde_json::to_vec(&doc).map_err(Error::IgnitionRender)
}

/// Navigate to (creating if absent) `doc.storage.files`, rejecting a
/// caller-supplied payload where any of those keys is present but holds the
/// wrong JSON shape, rather than panicking on it (§7: no panics on valid
/// input — and a structurally odd but parseable payload is still "valid
/// input" as far as JSON parsing is concerned).
fn ignition_files_mut(doc: &mut Value) -> Result<&mut Vec<Value>> {
    let storage = doc
        .as_object_mut()
        .ok_or_else(|| Error::IgnitionShape("ignition document root".to_string()))?
        .entry("storage")
        .or_insert_with(|| json!({}));
    let files = storage
        .as_object_mut()
        .ok_or_else(|| Error::IgnitionShape("\"storage\" field".to_string()))?
        .entry("files")
        .or_insert_with(|| json!([]));
    files
        .as_array_mut()
        .ok_or_else(|| Error::IgnitionShape("\"storage.files\" field".to_string()))
}

/// Navigate to (creating if absent) `doc.systemd.units`; see
/// [`ignition_files_mut`] for why this returns an error instead of panicking.
fn ignition_units_mut(doc: &mut Value) -> Result<&mut Vec<Value>> {
    let systemd = doc
        .as_object_mut()
        .ok_or_else(|| Error::IgnitionShape("ignition document root".to_string()))?
        .entry("systemd")
        .or_insert_with(|| json!({}));
    let units = systemd
        .as_object_mut()
        .ok_or_else(|| Error::IgnitionShape("\"systemd\" field".to_string()))?
        .entry("units")
        .or_insert_with(|| json!([]));
    units
        .as_array_mut()
        .ok_or_else(|| Error::IgnitionShape("\"systemd.units\" field".to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::IpConfig;

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
            mtu: None,
            routes: Vec::new(),
            policy_rules: Vec::new(),
            vrf: None,
        }
    }

    #[test]
    fn merges_generated_fragment_into_empty_payload() {
        let out = render_ignition(&[], &[iface()], "uuid-1", "host-1", "provider-1", None, Some("10.10.10.5")).unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        let files = parsed["storage"]["files"].as_array().unwrap();
        assert!(files.iter().any(|f| f["path"] == "/etc/hostname"));
        assert!(files.iter().any(|f| f["path"] == "/etc/proxmox-env"));
        assert!(files.iter().any(|f| f["path"] == "/etc/systemd/network/10-eth0.network"));
        let units = parsed["systemd"]["units"].as_array().unwrap();
        assert!(units.iter().any(|u| u["name"] == "systemd-resolved.service" && u["enabled"] == true));
    }

    #[test]
    fn preserves_caller_supplied_fields() {
        let caller = json!({ "ignition": { "version": "3.4.0" }, "passwd": { "users": [{"name": "core"}] } });
        let out = render_ignition(
            caller.to_string().as_bytes(),
            &[iface()],
            "uuid-1",
            "host-1",
            "provider-1",
            None,
            None,
        )
        .unwrap();
        let parsed: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["passwd"]["users"][0]["name"], "core");
    }

    #[test]
    fn rejects_a_non_object_top_level_payload_instead_of_panicking() {
        let caller = json!(["not", "an", "object"]);
        let err = render_ignition(caller.to_string().as_bytes(), &[iface()], "uuid-1", "host-1", "provider-1", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::IgnitionShape(_)));
    }

    #[test]
    fn rejects_a_non_object_storage_field_instead_of_panicking() {
        let caller = json!({ "ignition": { "version": "3.4.0" }, "storage": "not an object" });
        let err = render_ignition(caller.to_string().as_bytes(), &[iface()], "uuid-1", "host-1", "provider-1", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::IgnitionShape(_)));
    }

    #[test]
    fn rejects_a_non_object_systemd_field_instead_of_panicking() {
        let caller = json!({ "ignition": { "version": "3.4.0" }, "systemd": [] });
        let err = render_ignition(caller.to_string().as_bytes(), &[iface()], "uuid-1", "host-1", "provider-1", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::IgnitionShape(_)));
    }
}
