//! Networking rule
//!
//! The peer table of one CLADNet. Rows are appended by the control plane when
//! a host joins and are never removed; a departed host is marked `released`.
//! Every lookup the data path needs is served from a hash index rebuilt on
//! mutation.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a peer as published in the rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    #[default]
    Configuring,
    Tunneling,
    Closing,
    Released,
    Failed,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerState::Configuring => "configuring",
            PeerState::Tunneling => "tunneling",
            PeerState::Closing => "closing",
            PeerState::Released => "released",
            PeerState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where a peer's VM lives inside its cloud
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudInformation {
    pub provider: String,
    pub virtual_network_id: String,
    pub subnet_id: String,
    pub availability_zone_id: String,
}

impl CloudInformation {
    pub fn new(
        provider: impl Into<String>,
        virtual_network_id: impl Into<String>,
        subnet_id: impl Into<String>,
        availability_zone_id: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            virtual_network_id: virtual_network_id.into(),
            subnet_id: subnet_id.into(),
            availability_zone_id: availability_zone_id.into(),
        }
    }

    /// Every placement field is set; anything less cannot prove a private path
    pub fn is_complete(&self) -> bool {
        [
            &self.provider,
            &self.virtual_network_id,
            &self.subnet_id,
            &self.availability_zone_id,
        ]
        .iter()
        .all(|field| !field.is_empty())
    }
}

/// One host of a CLADNet
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    pub host_id: String,
    pub host_name: String,
    /// Block assigned to this host inside the CLADNet
    pub ipv4_network: Option<Ipv4Net>,
    /// CLADNet address of this host
    pub ipv4_address: Option<Ipv4Addr>,
    pub host_private_ipv4_address: Option<Ipv4Addr>,
    pub host_public_ipv4_address: Option<Ipv4Addr>,
    pub state: PeerState,
    pub cloud_information: Option<CloudInformation>,
}

impl Peer {
    pub fn new(host_id: impl Into<String>, host_name: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            host_name: host_name.into(),
            ..Default::default()
        }
    }

    pub fn with_cladnet_address(mut self, network: Ipv4Net, address: Ipv4Addr) -> Self {
        self.ipv4_network = Some(network);
        self.ipv4_address = Some(address);
        self
    }

    pub fn with_host_addresses(mut self, private: Option<Ipv4Addr>, public: Option<Ipv4Addr>) -> Self {
        self.host_private_ipv4_address = private;
        self.host_public_ipv4_address = public;
        self
    }

    pub fn with_cloud_information(mut self, cloud_information: CloudInformation) -> Self {
        self.cloud_information = Some(cloud_information);
        self
    }

    pub fn with_state(mut self, state: PeerState) -> Self {
        self.state = state;
        self
    }

    /// Overwrite with the non-blank fields of `update`; state always wins
    fn merge(&mut self, update: Peer) {
        if !update.host_name.is_empty() {
            self.host_name = update.host_name;
        }
        if update.ipv4_network.is_some() {
            self.ipv4_network = update.ipv4_network;
        }
        if update.ipv4_address.is_some() {
            self.ipv4_address = update.ipv4_address;
        }
        if update.host_private_ipv4_address.is_some() {
            self.host_private_ipv4_address = update.host_private_ipv4_address;
        }
        if update.host_public_ipv4_address.is_some() {
            self.host_public_ipv4_address = update.host_public_ipv4_address;
        }
        if let Some(update_cloud) = update.cloud_information {
            let cloud = self.cloud_information.get_or_insert_with(CloudInformation::default);
            if !update_cloud.provider.is_empty() {
                cloud.provider = update_cloud.provider;
            }
            if !update_cloud.virtual_network_id.is_empty() {
                cloud.virtual_network_id = update_cloud.virtual_network_id;
            }
            if !update_cloud.subnet_id.is_empty() {
                cloud.subnet_id = update_cloud.subnet_id;
            }
            if !update_cloud.availability_zone_id.is_empty() {
                cloud.availability_zone_id = update_cloud.availability_zone_id;
            }
        }
        self.state = update.state;
    }
}

/// A broken invariant found by [`NetworkingRule::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleViolation {
    /// CLADNet address outside the host's own block
    AddressOutsideNetwork {
        host_id: String,
        address: Ipv4Addr,
        network: Ipv4Net,
    },
    /// Two hosts share a CLADNet address
    DuplicateAddress {
        address: Ipv4Addr,
        host_ids: (String, String),
    },
}

impl fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleViolation::AddressOutsideNetwork { host_id, address, network } => {
                write!(f, "{} has address {} outside {}", host_id, address, network)
            }
            RuleViolation::DuplicateAddress { address, host_ids } => {
                write!(f, "{} and {} share address {}", host_ids.0, host_ids.1, address)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RuleIndex {
    host_id: HashMap<String, usize>,
    host_name: HashMap<String, usize>,
    ipv4_network: HashMap<Ipv4Net, usize>,
    ipv4_address: HashMap<Ipv4Addr, usize>,
    public_ipv4_address: HashMap<Ipv4Addr, usize>,
}

impl RuleIndex {
    /// First row wins when a secondary key repeats
    fn insert(&mut self, idx: usize, peer: &Peer) {
        self.host_id.entry(peer.host_id.clone()).or_insert(idx);
        if !peer.host_name.is_empty() {
            self.host_name.entry(peer.host_name.clone()).or_insert(idx);
        }
        if let Some(network) = peer.ipv4_network {
            self.ipv4_network.entry(network).or_insert(idx);
        }
        if let Some(address) = peer.ipv4_address {
            self.ipv4_address.entry(address).or_insert(idx);
        }
        if let Some(address) = peer.host_public_ipv4_address {
            self.public_ipv4_address.entry(address).or_insert(idx);
        }
    }

    fn build(peers: &[Peer]) -> Self {
        let mut index = Self::default();
        for (idx, peer) in peers.iter().enumerate() {
            index.insert(idx, peer);
        }
        index
    }
}

#[derive(Serialize, Deserialize)]
struct RuleRecord {
    #[serde(default)]
    cladnet_id: String,
    #[serde(default)]
    peers: Vec<Peer>,
}

/// Ordered peer table for one CLADNet, keyed by host id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RuleRecord", into = "RuleRecord")]
pub struct NetworkingRule {
    cladnet_id: String,
    peers: Vec<Peer>,
    index: RuleIndex,
}

impl From<RuleRecord> for NetworkingRule {
    fn from(record: RuleRecord) -> Self {
        let mut rule = NetworkingRule::new(record.cladnet_id);
        for peer in record.peers {
            rule.append_rule(peer);
        }
        rule
    }
}

impl From<NetworkingRule> for RuleRecord {
    fn from(rule: NetworkingRule) -> Self {
        RuleRecord {
            cladnet_id: rule.cladnet_id,
            peers: rule.peers,
        }
    }
}

impl PartialEq for NetworkingRule {
    fn eq(&self, other: &Self) -> bool {
        self.cladnet_id == other.cladnet_id && self.peers == other.peers
    }
}

impl Eq for NetworkingRule {}

impl NetworkingRule {
    pub fn new(cladnet_id: impl Into<String>) -> Self {
        Self {
            cladnet_id: cladnet_id.into(),
            ..Default::default()
        }
    }

    pub fn cladnet_id(&self) -> &str {
        &self.cladnet_id
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer(&self, idx: usize) -> Option<&Peer> {
        self.peers.get(idx)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Insert `peer` unless its host id is already present.
    ///
    /// Returns whether a row was added.
    pub fn append_rule(&mut self, peer: Peer) -> bool {
        if self.contains(&peer.host_id) {
            return false;
        }

        let idx = self.peers.len();
        self.index.insert(idx, &peer);
        self.peers.push(peer);
        true
    }

    /// Overwrite the non-blank fields of an existing row, or append if unknown
    pub fn update_rule(&mut self, peer: Peer) {
        match self.index_of_host_id(&peer.host_id) {
            Some(idx) => {
                self.peers[idx].merge(peer);
                self.index = RuleIndex::build(&self.peers);
            }
            None => {
                self.append_rule(peer);
            }
        }
    }

    pub fn contains(&self, host_id: &str) -> bool {
        self.index.host_id.contains_key(host_id)
    }

    pub fn index_of_host_id(&self, host_id: &str) -> Option<usize> {
        self.index.host_id.get(host_id).copied()
    }

    pub fn index_of_host_name(&self, host_name: &str) -> Option<usize> {
        self.index.host_name.get(host_name).copied()
    }

    pub fn index_of_ipv4_network(&self, network: &Ipv4Net) -> Option<usize> {
        self.index.ipv4_network.get(network).copied()
    }

    pub fn index_of_ipv4_address(&self, address: &Ipv4Addr) -> Option<usize> {
        self.index.ipv4_address.get(address).copied()
    }

    pub fn index_of_public_ipv4_address(&self, address: &Ipv4Addr) -> Option<usize> {
        self.index.public_ipv4_address.get(address).copied()
    }

    pub fn peer_by_host_id(&self, host_id: &str) -> Option<&Peer> {
        self.index_of_host_id(host_id).and_then(|idx| self.peers.get(idx))
    }

    pub fn peer_by_ipv4_address(&self, address: &Ipv4Addr) -> Option<&Peer> {
        self.index_of_ipv4_address(address).and_then(|idx| self.peers.get(idx))
    }

    /// Check address invariants; the rule still works with violations present
    pub fn validate(&self) -> Vec<RuleViolation> {
        let mut violations = Vec::new();
        let mut owners: HashMap<Ipv4Addr, &str> = HashMap::new();

        for peer in &self.peers {
            let Some(address) = peer.ipv4_address else {
                continue;
            };

            if let Some(network) = peer.ipv4_network {
                if !network.contains(&address) {
                    violations.push(RuleViolation::AddressOutsideNetwork {
                        host_id: peer.host_id.clone(),
                        address,
                        network,
                    });
                }
            }

            if let Some(owner) = owners.insert(address, &peer.host_id) {
                violations.push(RuleViolation::DuplicateAddress {
                    address,
                    host_ids: (owner.to_string(), peer.host_id.clone()),
                });
            }
        }

        violations
    }
}
