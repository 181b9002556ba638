//! Memory-aware, round-robin node selection for placing a new VM.
//!
//! Expressed as a pure function over a narrow trait so it is unit-testable
//! without a hypervisor or a live cluster resource.

use std::collections::HashMap;

use thiserror::Error;

pub const MIB: u64 = 1024 * 1024;

/// A source of per-node reservable memory, in bytes. Implemented for
/// `HashMap<String, u64>` for tests; production callers populate one from
/// `ProxmoxClient::get_reservable_memory_bytes` before calling [`select_node`].
pub trait ReservableMemorySource {
    fn reservable_bytes(&self, node: &str) -> Option<u64>;
}

impl ReservableMemorySource for HashMap<String, u64> {
    fn reservable_bytes(&self, node: &str) -> Option<u64> {
        self.get(node).copied()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no node in the allow-list has enough reservable memory for the request")]
    InsufficientMemory,
}

/// A placement decision request.
pub struct SchedulingRequest<'a> {
    /// Candidate nodes; machine-level allow-list overrides the cluster-level one.
    pub allow_list: &'a [String],
    pub memory_request_mib: u64,
    /// Count of prior placements per node, from the cluster's node-locations map.
    pub placement_counts: &'a HashMap<String, u64>,
}

/// Select a node for a new VM.
///
/// Filters `allow_list` down to nodes with enough reservable memory, then
/// picks the node with the fewest prior placements; ties are broken in favor
/// of the node with the most remaining reservable memory, so a near-full
/// node never wins a tie over a near-empty one.
pub fn select_node<S: ReservableMemorySource>(
    source: &S,
    request: &SchedulingRequest,
) -> Result<String, SchedulerError> {
    let bytes_needed = request.memory_request_mib * MIB;

    let mut candidates: Vec<(&str, u64)> = request
        .allow_list
        .iter()
        .filter_map(|node| source.reservable_bytes(node).map(|reservable| (node.as_str(), reservable)))
        .filter(|(_, reservable)| *reservable >= bytes_needed)
        .collect();

    if candidates.is_empty() {
        return Err(SchedulerError::InsufficientMemory);
    }

    candidates.sort_by(|(node_a, reservable_a), (node_b, reservable_b)| {
        let count_a = request.placement_counts.get(*node_a).copied().unwrap_or(0);
        let count_b = request.placement_counts.get(*node_b).copied().unwrap_or(0);
        count_a.cmp(&count_b).then(reservable_b.cmp(reservable_a))
    });

    Ok(candidates[0].0.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    fn nodes(pairs: &[(&str, u64)]) -> HashMap<String, u64> {
        pairs.iter().map(|(n, m)| (n.to_string(), m * MIB)).collect()
    }

    #[test]
    fn round_robin_balances_across_six_placements_then_fails() {
        let allow_list = vec!["pve1".to_string(), "pve2".to_string(), "pve3".to_string()];
        let mut reservable = nodes(&[("pve1", 20), ("pve2", 30), ("pve3", 15)]);
        let mut placement_counts: HashMap<String, u64> = HashMap::new();

        let expected = ["pve2", "pve1", "pve3", "pve2", "pve1", "pve2"];
        let mut picks = Vec::new();

        for _ in 0..6 {
            let request = SchedulingRequest {
                allow_list: &allow_list,
                memory_request_mib: 8,
                placement_counts: &placement_counts,
            };
            let picked = select_node(&reservable, &request).expect("placement should succeed");
            *reservable.get_mut(&picked).unwrap() -= 8 * MIB;
            *placement_counts.entry(picked.clone()).or_insert(0) += 1;
            picks.push(picked);
        }

        assert_eq!(picks, expected);

        let request = SchedulingRequest {
            allow_list: &allow_list,
            memory_request_mib: 8,
            placement_counts: &placement_counts,
        };
        let result = select_node(&reservable, &request);
        assert_eq!(result, Err(SchedulerError::InsufficientMemory));

        assert_eq!(reservable.get("pve1").copied(), Some(4 * MIB));
        assert_eq!(reservable.get("pve2").copied(), Some(6 * MIB));
        assert_eq!(reservable.get("pve3").copied(), Some(7 * MIB));
    }

    #[test]
    fn single_feasible_node_is_returned_without_a_tie() {
        let allow_list = vec!["only".to_string()];
        let reservable = nodes(&[("only", 100)]);
        let placement_counts = HashMap::new();
        let request = SchedulingRequest {
            allow_list: &allow_list,
            memory_request_mib: 8,
            placement_counts: &placement_counts,
        };
        assert_eq!(select_node(&reservable, &request).unwrap(), "only");
    }

    #[test]
    fn node_missing_from_the_memory_source_is_not_a_candidate() {
        let allow_list = vec!["ghost".to_string(), "pve1".to_string()];
        let reservable = nodes(&[("pve1", 100)]);
        let placement_counts = HashMap::new();
        let request = SchedulingRequest {
            allow_list: &allow_list,
            memory_request_mib: 8,
            placement_counts: &placement_counts,
        };
        assert_eq!(select_node(&reservable, &request).unwrap(), "pve1");
    }
}
