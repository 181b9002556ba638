//! Wire-format parsing and serialization for the VM config strings the
//! Proxmox API accepts and returns verbatim inside a `config` object.

use crate::error::{Error, Result};
use crate::types::NetworkInterfaceConfig;

use std::sync::LazyLock;

use regex::Regex;

// Tolerant of extra whitespace around commas/equals and of key order, since the
// hypervisor is free to reorder trailing optional fields.
static MAC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^[0-9a-f]{2}(:[0-9a-f]{2}){5}$").unwrap());
static BRIDGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap());

/// Parse a `"{model}={MAC},bridge={br}[,mtu={n}][,tag={v}]"` line, as emitted
/// by Proxmox for a `net{N}` config key.
pub fn parse_network_interface(raw: &str) -> Result<NetworkInterfaceConfig> {
    let mut model = None;
    let mut mac = None;
    let mut bridge = None;
    let mut mtu = None;
    let mut tag = None;

    for field in raw.split(',') {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        if let Some((key, value)) = field.split_once('=') {
            let (key, value) = (key.trim(), value.trim());
            match key {
                "bridge" => bridge = Some(value.to_string()),
                "mtu" => {
                    mtu = Some(value.parse::<u32>().map_err(|_| Error::Parse {
                        what: "mtu",
                        input: raw.to_string(),
                    })?)
                }
                "tag" => {
                    tag = Some(value.parse::<u32>().map_err(|_| Error::Parse {
                        what: "tag",
                        input: raw.to_string(),
                    })?)
                }
                // any other known model name (virtio, e1000, vmxnet3, ...) carries the MAC
                _ if MAC_RE.is_match(value) => {
                    model = Some(key.to_string());
                    mac = Some(value.to_uppercase());
                }
                _ => {}
            }
        }
    }

    let model = model.ok_or(Error::Parse {
        what: "network interface model",
        input: raw.to_string(),
    })?;
    let mac = mac.ok_or(Error::Parse {
        what: "network interface mac",
        input: raw.to_string(),
    })?;
    let bridge = bridge.ok_or(Error::Parse {
        what: "network interface bridge",
        input: raw.to_string(),
    })?;
    if !BRIDGE_RE.is_match(&bridge) {
        return Err(Error::Parse {
            what: "network interface bridge",
            input: raw.to_string(),
        });
    }

    Ok(NetworkInterfaceConfig {
        model,
        mac,
        bridge,
        mtu,
        tag,
    })
}

/// Serialize a [`NetworkInterfaceConfig`] back to the Proxmox wire form.
/// `mtu` is emitted only when `>= 576`; `tag` only when nonzero.
pub fn format_network_interface(cfg: &NetworkInterfaceConfig) -> String {
    let mut out = format!("{}={},bridge={}", cfg.model, cfg.mac, cfg.bridge);
    if let Some(mtu) = cfg.mtu {
        if mtu >= 576 {
            out.push_str(&format!(",mtu={mtu}"));
        }
    }
    if let Some(tag) = cfg.tag {
        if tag != 0 {
            out.push_str(&format!(",tag={tag}"));
        }
    }
    out
}

/// Parse the firmware UUID out of a `"uuid={UUID}[,...]"` SMBIOS1 config string.
pub fn parse_smbios_uuid(raw: &str) -> Option<String> {
    raw.split(',').find_map(|field| {
        let field = field.trim();
        field.strip_prefix("uuid=").map(|uuid| uuid.to_string())
    })
}

/// Serialize a firmware UUID as an SMBIOS1 config string.
pub fn format_smbios_uuid(uuid: &str) -> String {
    format!("uuid={uuid}")
}

/// Build the `"ip_{device}_{address}"` VM tag used to surface an assigned
/// address on the VM's tag set.
pub fn ip_tag(device: &str, address: &str) -> String {
    format!("ip_{device}_{address}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_full_interface() {
        let cfg = NetworkInterfaceConfig {
            model: "virtio".into(),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            bridge: "vmbr0".into(),
            mtu: Some(1500),
            tag: Some(42),
        };
        let raw = format_network_interface(&cfg);
        assert_eq!(raw, "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0,mtu=1500,tag=42");
        assert_eq!(parse_network_interface(&raw).unwrap(), cfg);
    }

    #[test]
    fn omits_mtu_below_threshold_and_zero_tag() {
        let cfg = NetworkInterfaceConfig {
            model: "virtio".into(),
            mac: "AA:BB:CC:DD:EE:FF".into(),
            bridge: "vmbr0".into(),
            mtu: Some(500),
            tag: Some(0),
        };
        let raw = format_network_interface(&cfg);
        assert_eq!(raw, "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0");
    }

    #[test]
    fn parses_minimal_interface() {
        let parsed = parse_network_interface("virtio=aa:bb:cc:dd:ee:ff,bridge=vmbr0").unwrap();
        assert_eq!(parsed.mac, "AA:BB:CC:DD:EE:FF");
        assert_eq!(parsed.mtu, None);
        assert_eq!(parsed.tag, None);
    }

    #[test]
    fn rejects_missing_bridge() {
        assert!(parse_network_interface("virtio=aa:bb:cc:dd:ee:ff").is_err());
    }

    #[test]
    fn smbios_uuid_round_trips() {
        let raw = format_smbios_uuid("11111111-2222-3333-4444-555555555555");
        assert_eq!(
            parse_smbios_uuid(&raw).as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    #[test]
    fn builds_ip_tag() {
        assert_eq!(ip_tag("net0", "10.10.10.5"), "ip_net0_10.10.10.5");
    }
}
