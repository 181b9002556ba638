use serde::{Deserialize, Serialize};

/// Which IP family a claim is for; only used to build the deterministic claim
/// name suffix (`inet`/`inet6`) from §4.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Family::V4 => "inet",
            Family::V6 => "inet6",
        }
    }

    #[must_use]
    pub fn of_address(address: &str) -> Self {
        if address.contains(':') {
            Family::V6
        } else {
            Family::V4
        }
    }
}

/// An address the external pool controller bound to a claim, resolved enough
/// for the bootstrap renderer to consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub family: Family,
    pub address: String,
    pub prefix: u8,
    pub gateway: Option<String>,
    pub metric: Option<u32>,
}

/// Outcome of polling one claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimStatus {
    /// `status.addressRef` not yet set by the external pool controller.
    NotYetBound,
    Bound(ResolvedAddress),
}
