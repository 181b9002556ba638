//! Wires [`proxmox_scheduler::select_node`] to live hypervisor data and the
//! cluster's placement history (§4.2).

use proxmox_cluster::ProxmoxCluster;
use proxmox_client::client::ProxmoxClient;
use proxmox_operator::error::Result;
use proxmox_scheduler::{SchedulerError, SchedulingRequest};

use std::collections::HashMap;

/// Query reservable memory for every candidate node up front, so
/// [`proxmox_scheduler::select_node`] stays a pure function over the result.
pub async fn gather_reservable_memory(client: &dyn ProxmoxClient, allow_list: &[String]) -> Result<HashMap<String, u64>> {
    let mut out = HashMap::new();
    for node in allow_list {
        let bytes = client.get_reservable_memory_bytes(node).await?;
        out.insert(node.clone(), bytes);
    }
    Ok(out)
}

/// Select a node for a new VM, using the cluster's combined placement
/// history as the round-robin tiebreak input (§4.2).
pub fn select(
    reservable: &HashMap<String, u64>,
    allow_list: &[String],
    memory_request_mib: u64,
    cluster: &ProxmoxCluster,
) -> Result<String, SchedulerError> {
    let placement_counts = placement_counts(cluster);
    let request = SchedulingRequest {
        allow_list,
        memory_request_mib,
        placement_counts: &placement_counts,
    };
    proxmox_scheduler::select_node(reservable, &request)
}

fn placement_counts(cluster: &ProxmoxCluster) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    for node in cluster.status.clone().unwrap_or_default().all_node_locations().values() {
        *counts.entry(node.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod test {
    use super::*;
    use proxmox_cluster::crd::ProxmoxClusterStatus;
    use std::collections::BTreeMap;

    #[test]
    fn placement_counts_combine_control_plane_and_worker_locations() {
        let mut cluster = ProxmoxCluster::new("test", Default::default());
        cluster.status = Some(ProxmoxClusterStatus {
            control_plane_node_locations: BTreeMap::from([("cp-0".to_string(), "pve1".to_string())]),
            worker_node_locations: BTreeMap::from([
                ("worker-0".to_string(), "pve1".to_string()),
                ("worker-1".to_string(), "pve2".to_string()),
            ]),
            ..Default::default()
        });
        let counts = placement_counts(&cluster);
        assert_eq!(counts.get("pve1"), Some(&2));
        assert_eq!(counts.get("pve2"), Some(&1));
    }
}
