//! Destination selection
//!
//! Picks which of a peer's host addresses a tunneled packet is sent to. Cloud
//! providers bill traffic that leaves the virtual network, so when both ends
//! sit close enough together the private address is used instead.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rule::Peer;

/// Destination selection errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("unknown rule type: {0}")]
    UnknownRuleType(String),

    #[error("unknown cloud service provider: {0}")]
    UnknownCloudServiceProvider(String),

    #[error("peer {host_id} has no {kind} IPv4 address")]
    MissingAddress { host_id: String, kind: &'static str },
}

/// How a destination address is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RuleType {
    /// Always the public address
    #[default]
    #[serde(rename = "basic")]
    Basic,
    /// Private address when placement makes it reachable and free
    #[serde(rename = "cost-prioritized")]
    CostPrioritized,
}

impl FromStr for RuleType {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(RuleType::Basic),
            "cost-prioritized" => Ok(RuleType::CostPrioritized),
            other => Err(PolicyError::UnknownRuleType(other.to_string())),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::Basic => f.write_str("basic"),
            RuleType::CostPrioritized => f.write_str("cost-prioritized"),
        }
    }
}

/// Cloud providers with a known private reachability model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudProvider {
    /// Subnets are zonal; cross-subnet traffic is routed through the VPC router
    Aws,
    Azure,
    /// VPCs are global and flat
    Gcp,
    Alibaba,
}

impl FromStr for CloudProvider {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" => Ok(CloudProvider::Gcp),
            "alibaba" => Ok(CloudProvider::Alibaba),
            _ => Err(PolicyError::UnknownCloudServiceProvider(s.to_string())),
        }
    }
}

impl CloudProvider {
    /// Whether two hosts in the same virtual network reach each other privately
    fn private_reachable(&self, subnet: (&str, &str), zone: (&str, &str)) -> bool {
        match self {
            CloudProvider::Aws => subnet.0 == subnet.1,
            CloudProvider::Azure | CloudProvider::Alibaba => zone.0 == zone.1,
            CloudProvider::Gcp => true,
        }
    }
}

/// Select the host address of `destination` that `source` sends to
pub fn select_destination(
    rule_type: RuleType,
    source: &Peer,
    destination: &Peer,
) -> Result<Ipv4Addr, PolicyError> {
    let use_private = match rule_type {
        RuleType::Basic => false,
        RuleType::CostPrioritized => prefers_private(source, destination)?,
    };

    if use_private {
        destination
            .host_private_ipv4_address
            .ok_or_else(|| PolicyError::MissingAddress {
                host_id: destination.host_id.clone(),
                kind: "private",
            })
    } else {
        destination
            .host_public_ipv4_address
            .ok_or_else(|| PolicyError::MissingAddress {
                host_id: destination.host_id.clone(),
                kind: "public",
            })
    }
}

fn prefers_private(source: &Peer, destination: &Peer) -> Result<bool, PolicyError> {
    let (Some(src), Some(dst)) = (&source.cloud_information, &destination.cloud_information) else {
        return Ok(false);
    };
    if !src.is_complete() || !dst.is_complete() {
        return Ok(false);
    }

    if !src.provider.eq_ignore_ascii_case(&dst.provider)
        || src.virtual_network_id != dst.virtual_network_id
    {
        return Ok(false);
    }

    let provider: CloudProvider = src.provider.parse()?;
    Ok(provider.private_reachable(
        (src.subnet_id.as_str(), dst.subnet_id.as_str()),
        (src.availability_zone_id.as_str(), dst.availability_zone_id.as_str()),
    ))
}
