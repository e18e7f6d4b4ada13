//! Private address space recommendation
//!
//! Proposes an RFC 1918 block for a new CLADNet given the CIDR blocks already
//! used by the VMs that will join it. Collision avoidance works per prefix
//! length: any occupied block of length /n inside a private range disables /n
//! for that whole range. This is coarse and can reject space that is still
//! free, and a recommended block can still share addresses with an occupied
//! block of a different length.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Recommendation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("no appropriate address space")]
    NoAppropriateAddressSpace,
}

/// Network, broadcast and gateway addresses on top of the hosts
const RESERVED_ADDRESSES: usize = 3;

/// Private range and the prefix lengths still free in it
#[derive(Debug, Clone)]
struct PrefixAvailability {
    base: Ipv4Addr,
    min_prefix: u8,
    available: BTreeMap<u8, bool>,
}

impl PrefixAvailability {
    fn new(base: Ipv4Addr, min_prefix: u8) -> Self {
        let available = (min_prefix..=32).map(|prefix| (prefix, true)).collect();
        Self {
            base,
            min_prefix,
            available,
        }
    }

    fn contains(&self, cidr: &Ipv4Net) -> bool {
        Ipv4Net::new(self.base, self.min_prefix)
            .map(|range| range.contains(cidr))
            .unwrap_or(false)
    }

    fn mark_used(&mut self, cidr: &Ipv4Net) -> bool {
        if !self.contains(cidr) {
            return false;
        }
        if let Some(flag) = self.available.get_mut(&cidr.prefix_len()) {
            *flag = false;
        }
        true
    }

    /// Available blocks of at most `needed` prefix length, most specific first
    fn candidates(&self, needed: u8) -> Vec<Ipv4Net> {
        self.available
            .iter()
            .rev()
            .filter(|(prefix, available)| **available && **prefix <= needed)
            .filter_map(|(prefix, _)| Ipv4Net::new(self.base, *prefix).ok())
            .collect()
    }
}

/// A recommended CLADNet block and every other block that would fit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableIpv4PrivateAddressSpaces {
    pub recommended_ipv4_private_address_space: Ipv4Net,
    pub address_space_10s: Vec<Ipv4Net>,
    pub address_space_172s: Vec<Ipv4Net>,
    pub address_space_192s: Vec<Ipv4Net>,
}

/// Longest prefix whose block holds `capacity` addresses
fn needed_prefix_len(capacity: usize) -> Option<u8> {
    let host_bits = usize::BITS - (capacity.max(2) - 1).leading_zeros();
    32u32.checked_sub(host_bits).and_then(|prefix| u8::try_from(prefix).ok())
}

/// Recommend a private block for a CLADNet whose members already use `existing_cidrs`
pub fn get_available_ipv4_private_address_spaces<S: AsRef<str>>(
    existing_cidrs: &[S],
) -> Result<AvailableIpv4PrivateAddressSpaces, AddressSpaceError> {
    let mut space_192 = PrefixAvailability::new(Ipv4Addr::new(192, 168, 0, 0), 16);
    let mut space_172 = PrefixAvailability::new(Ipv4Addr::new(172, 16, 0, 0), 12);
    let mut space_10 = PrefixAvailability::new(Ipv4Addr::new(10, 0, 0, 0), 8);

    for cidr in existing_cidrs {
        let cidr = cidr.as_ref().trim();
        let net: Ipv4Net = cidr
            .parse()
            .map_err(|_| AddressSpaceError::InvalidCidr(cidr.to_string()))?;

        let marked = space_192.mark_used(&net) || space_172.mark_used(&net) || space_10.mark_used(&net);
        if !marked {
            debug!("Ignoring non-private CIDR {}", net);
        }
    }

    let needed = needed_prefix_len(existing_cidrs.len() + RESERVED_ADDRESSES)
        .ok_or(AddressSpaceError::NoAppropriateAddressSpace)?;

    let address_space_192s = space_192.candidates(needed);
    let address_space_172s = space_172.candidates(needed);
    let address_space_10s = space_10.candidates(needed);

    let recommended = address_space_192s
        .first()
        .or_else(|| address_space_172s.first())
        .or_else(|| address_space_10s.first())
        .copied()
        .ok_or(AddressSpaceError::NoAppropriateAddressSpace)?;

    debug!(
        "Recommended {} for {} existing blocks (needs /{} or larger)",
        recommended,
        existing_cidrs.len(),
        needed
    );

    Ok(AvailableIpv4PrivateAddressSpaces {
        recommended_ipv4_private_address_space: recommended,
        address_space_10s,
        address_space_172s,
        address_space_192s,
    })
}
