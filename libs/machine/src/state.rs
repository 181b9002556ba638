//! The reconciler's state variable, typed rather than read back out of a
//! condition's `reason` string at every call site (Design Note 1).
//!
//! `MachineState` is declared in the exact order §4.1 walks through the
//! lifecycle, so `derive(PartialOrd, Ord)` gives the natural "has this state
//! machine moved forward" ordering for free; [`Display`]/[`FromStr`] are the
//! only two places the condition-reason string representation is produced
//! or parsed.

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MachineState {
    #[default]
    WaitingForClusterInfrastructure,
    WaitingForBootstrapData,
    Cloning,
    WaitingForDiskReconciliation,
    WaitingForStaticIPAllocation,
    WaitingForBootstrapDataReconciliation,
    WaitingForVMPowerUp,
    WaitingForClusterAPIMachineAddresses,
    WaitingForCloudInit,
    WaitingForBootstrapReady,
    Ready,
    /// Terminal failure: the hypervisor resource observed at the recorded
    /// vmid/node no longer matches this machine's identity (§4.1 edge case).
    UnknownMachine,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::WaitingForClusterInfrastructure => "WaitingForClusterInfrastructure",
            MachineState::WaitingForBootstrapData => "WaitingForBootstrapData",
            MachineState::Cloning => "Cloning",
            MachineState::WaitingForDiskReconciliation => "WaitingForDiskReconciliation",
            MachineState::WaitingForStaticIPAllocation => "WaitingForStaticIPAllocation",
            MachineState::WaitingForBootstrapDataReconciliation => "WaitingForBootstrapDataReconciliation",
            MachineState::WaitingForVMPowerUp => "WaitingForVMPowerUp",
            MachineState::WaitingForClusterAPIMachineAddresses => "WaitingForClusterAPIMachineAddresses",
            MachineState::WaitingForCloudInit => "WaitingForCloudInit",
            MachineState::WaitingForBootstrapReady => "WaitingForBootstrapReady",
            MachineState::Ready => "Ready",
            MachineState::UnknownMachine => "UnknownMachine",
        };
        f.write_str(s)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0:?} is not a recognized machine state")]
pub struct ParseMachineStateError(String);

impl FromStr for MachineState {
    type Err = ParseMachineStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "WaitingForClusterInfrastructure" => MachineState::WaitingForClusterInfrastructure,
            "WaitingForBootstrapData" => MachineState::WaitingForBootstrapData,
            "Cloning" => MachineState::Cloning,
            "WaitingForDiskReconciliation" => MachineState::WaitingForDiskReconciliation,
            "WaitingForStaticIPAllocation" => MachineState::WaitingForStaticIPAllocation,
            "WaitingForBootstrapDataReconciliation" => MachineState::WaitingForBootstrapDataReconciliation,
            "WaitingForVMPowerUp" => MachineState::WaitingForVMPowerUp,
            "WaitingForClusterAPIMachineAddresses" => MachineState::WaitingForClusterAPIMachineAddresses,
            "WaitingForCloudInit" => MachineState::WaitingForCloudInit,
            "WaitingForBootstrapReady" => MachineState::WaitingForBootstrapReady,
            "Ready" => MachineState::Ready,
            "UnknownMachine" => MachineState::UnknownMachine,
            other => return Err(ParseMachineStateError(other.to_string())),
        })
    }
}

impl MachineState {
    #[must_use]
    pub fn is_terminal_failure(self) -> bool {
        matches!(self, MachineState::UnknownMachine)
    }

    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, MachineState::Ready)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip_every_variant() {
        let all = [
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
            MachineState::UnknownMachine,
        ];
        for state in all {
            let parsed: MachineState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn unrecognized_reason_is_an_error() {
        assert!("NotAState".parse::<MachineState>().is_err());
    }

    #[test]
    fn states_are_ordered_by_lifecycle_progress() {
        assert!(MachineState::WaitingForClusterInfrastructure < MachineState::Cloning);
        assert!(MachineState::Cloning < MachineState::WaitingForVMPowerUp);
        assert!(MachineState::WaitingForBootstrapReady < MachineState::Ready);
    }
}
