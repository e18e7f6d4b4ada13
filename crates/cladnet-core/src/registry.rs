//! Peer registry
//!
//! Shares one [`NetworkingRule`] between the control-plane writer and the
//! packet loops. The lock belongs to the registry value; readers copy out what
//! they need and never hold it across I/O.

use std::net::Ipv4Addr;

use tokio::sync::RwLock;
use tracing::debug;

use crate::policy::{select_destination, PolicyError, RuleType};
use crate::rule::{NetworkingRule, Peer, PeerState};

/// Where an encapsulated packet goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Destination peer, whose key seals the packet
    pub host_id: String,
    /// Host address selected by the policy
    pub address: Ipv4Addr,
}

/// Concurrent owner of the networking rule
#[derive(Debug, Default)]
pub struct PeerRegistry {
    rule: RwLock<NetworkingRule>,
}

impl PeerRegistry {
    pub fn new(rule: NetworkingRule) -> Self {
        Self {
            rule: RwLock::new(rule),
        }
    }

    /// Swap the whole table
    pub async fn replace(&self, rule: NetworkingRule) {
        let mut current = self.rule.write().await;
        debug!(
            "Replacing networking rule {} ({} peers) with {} ({} peers)",
            current.cladnet_id(),
            current.len(),
            rule.cladnet_id(),
            rule.len()
        );
        *current = rule;
    }

    pub async fn append_rule(&self, peer: Peer) -> bool {
        self.rule.write().await.append_rule(peer)
    }

    pub async fn update_rule(&self, peer: Peer) {
        self.rule.write().await.update_rule(peer)
    }

    /// Record `state` on the row of `host_id`; returns false when there is no row
    pub async fn set_state(&self, host_id: &str, state: PeerState) -> bool {
        let mut rule = self.rule.write().await;
        if !rule.contains(host_id) {
            return false;
        }
        rule.update_rule(Peer::new(host_id, "").with_state(state));
        true
    }

    pub async fn contains(&self, host_id: &str) -> bool {
        self.rule.read().await.contains(host_id)
    }

    pub async fn peer(&self, host_id: &str) -> Option<Peer> {
        self.rule.read().await.peer_by_host_id(host_id).cloned()
    }

    pub async fn peer_by_ipv4_address(&self, address: &Ipv4Addr) -> Option<Peer> {
        self.rule.read().await.peer_by_ipv4_address(address).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rule.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rule.read().await.is_empty()
    }

    /// Copy of the current table
    pub async fn snapshot(&self) -> NetworkingRule {
        self.rule.read().await.clone()
    }

    /// Resolve the peer owning CLADNet address `destination` and the host
    /// address to send to.
    ///
    /// `Ok(None)` means no peer owns the address. A source missing from the
    /// table is treated as having no cloud placement.
    pub async fn route(
        &self,
        rule_type: RuleType,
        source_host_id: &str,
        destination: Ipv4Addr,
    ) -> Result<Option<Route>, PolicyError> {
        let rule = self.rule.read().await;

        let Some(destination_peer) = rule.peer_by_ipv4_address(&destination) else {
            return Ok(None);
        };

        let address = match rule.peer_by_host_id(source_host_id) {
            Some(source) => select_destination(rule_type, source, destination_peer)?,
            None => select_destination(rule_type, &Peer::new(source_host_id, ""), destination_peer)?,
        };

        Ok(Some(Route {
            host_id: destination_peer.host_id.clone(),
            address,
        }))
    }
}
