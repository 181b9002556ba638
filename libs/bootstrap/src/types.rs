use serde::{Deserialize, Serialize};

/// Selects which bootstrap payload format to render, driven by the `format`
/// key in the bootstrap secret (§4.6/§6). Defaults to cloud-config.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootstrapFormat {
    #[default]
    CloudConfig,
    Ignition,
}

#[derive(Clone, Debug, PartialEq)]
pub struct IpConfig {
    pub address: String,
    pub prefix: u8,
    pub gateway: Option<String>,
    pub metric: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Route {
    pub to: String,
    pub via: Option<String>,
    pub metric: Option<u32>,
    pub table: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolicyRule {
    pub from: Option<String>,
    pub to: Option<String>,
    pub table: u32,
    pub priority: Option<u32>,
}

/// One network interface with all data resolved, ready for templating into
/// cloud-config or Ignition (§4.6). `proxmox_name` is the hypervisor-side
/// device name (`net0`); `guest_name` is what the guest will know it as,
/// per Design Note 5 (`net0` -> `eth0`, no further inference).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedInterface {
    pub guest_name: String,
    pub proxmox_name: String,
    pub mac: String,
    pub ip_configs: Vec<IpConfig>,
    pub dns_servers: Vec<String>,
    pub mtu: Option<u32>,
    pub routes: Vec<Route>,
    pub policy_rules: Vec<PolicyRule>,
    pub vrf: Option<String>,
}

/// Everything the renderer needs to produce one bootstrap payload.
#[derive(Clone, Debug, Default)]
pub struct RenderInput {
    pub format: BootstrapFormat,
    pub interfaces: Vec<ResolvedInterface>,
    pub firmware_uuid: String,
    pub hostname: String,
    pub provider_id: String,
    pub zone: Option<String>,
    /// Primary interface's primary address, used for `proxmox-env`'s
    /// `PRIMARY_IP` and the instance-metadata `local-ipv4`.
    pub primary_ip: Option<String>,
    /// Raw bootstrap secret payload (`value` key); cloud-config data is
    /// passed through untouched, Ignition is parsed and merged.
    pub raw_payload: Vec<u8>,
}
