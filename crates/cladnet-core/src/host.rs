//! Host agent
//!
//! Composes identity, discovery, keys, the peer registry and the tunneling
//! engine into the API the control plane drives.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use cladnet_crypto::KeyManager;
use cladnet_network::{
    host_name, inquire_public_ipv4, local_network_interfaces, NetworkInterface, VirtualInterface,
};

use crate::config::CoreConfig;
use crate::engine::{interface_address, EngineState, EngineStats, TunnelingEngine};
use crate::error::{CoreError, CoreResult};
use crate::registry::PeerRegistry;
use crate::rule::NetworkingRule;

const HOST_ID_FILE: &str = "host_id";

/// What this host can observe about its own network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostNetworkInformation {
    pub host_name: String,
    pub is_encrypted: bool,
    pub public_ipv4_address: Option<Ipv4Addr>,
    pub network_interfaces: Vec<NetworkInterface>,
}

/// Load the persisted host id, creating one on first start
pub async fn load_or_create_host_id(state_dir: &Path) -> CoreResult<String> {
    let path = state_dir.join(HOST_ID_FILE);

    if path.exists() {
        let content = tokio::fs::read_to_string(&path).await?;
        let id = Uuid::parse_str(content.trim()).map_err(|e| {
            CoreError::Config(format!("corrupt host id in {}: {}", path.display(), e))
        })?;
        return Ok(id.to_string());
    }

    tokio::fs::create_dir_all(state_dir).await?;
    let id = Uuid::new_v4().to_string();
    tokio::fs::write(&path, &id).await?;
    info!("Created host id {} at {}", id, path.display());
    Ok(id)
}

/// One CLADNet member host
pub struct HostAgent {
    host_id: String,
    host_name: String,
    public_ipv4_address: Option<Ipv4Addr>,
    network_interfaces: Vec<NetworkInterface>,
    keys: Arc<KeyManager>,
    registry: Arc<PeerRegistry>,
    engine: Arc<TunnelingEngine>,
}

impl HostAgent {
    /// Discover this host and prepare an engine over `interface`
    pub async fn new(config: CoreConfig, interface: Arc<dyn VirtualInterface>) -> CoreResult<Self> {
        config.validate().map_err(CoreError::Config)?;

        let host_id = load_or_create_host_id(&config.state_dir).await?;
        let host_name = host_name();

        let public_ipv4_address = match config.public_ip {
            Some(ip) => Some(ip),
            None => match inquire_public_ipv4(&config.public_ip_services, config.public_ip_timeout).await {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!("Could not inquire public IP, continuing without it: {}", e);
                    None
                }
            },
        };

        let network_interfaces = local_network_interfaces();
        let keys = Arc::new(KeyManager::load_or_generate(&config.key_dir, &host_id).await?);
        let registry = Arc::new(PeerRegistry::default());
        let engine = TunnelingEngine::new(
            host_id.clone(),
            config,
            interface,
            Arc::clone(&registry),
            Arc::clone(&keys),
        );

        info!(
            "Host {} ({}) ready, public IP {}",
            host_name,
            host_id,
            public_ipv4_address.map_or_else(|| "unknown".to_string(), |ip| ip.to_string())
        );

        Ok(Self {
            host_id,
            host_name,
            public_ipv4_address,
            network_interfaces,
            keys,
            registry,
            engine,
        })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<TunnelingEngine> {
        &self.engine
    }

    /// Bring the virtual interface up with this host's CLADNet address
    pub async fn configure_network_interface(&self) -> CoreResult<()> {
        let own = self
            .registry
            .peer(&self.host_id)
            .await
            .ok_or_else(|| CoreError::HostNotInRule(self.host_id.clone()))?;

        let (Some(address), Some(network)) = (own.ipv4_address, own.ipv4_network) else {
            return Err(CoreError::HostNotInRule(self.host_id.clone()));
        };

        self.engine.configure(interface_address(address, network)?).await
    }

    /// Tunnel until closed
    pub async fn run(&self) -> CoreResult<()> {
        self.engine.run().await
    }

    pub async fn start_tunneling(&self) -> CoreResult<()> {
        self.run().await
    }

    pub async fn close(&self) -> CoreResult<()> {
        self.engine.close().await
    }

    pub async fn close_interface(&self) -> CoreResult<()> {
        self.close().await
    }

    /// Replace the networking rule
    pub async fn update_networking_rule(&self, rule: NetworkingRule) {
        for violation in rule.validate() {
            warn!("Networking rule {}: {}", rule.cladnet_id(), violation);
        }
        if !rule.contains(&self.host_id) {
            warn!("Networking rule {} has no row for this host", rule.cladnet_id());
        }
        self.registry.replace(rule).await;
    }

    pub async fn set_networking_rule(&self, rule: NetworkingRule) {
        self.update_networking_rule(rule).await
    }

    pub fn enable_encryption(&self, enabled: bool) {
        self.engine.set_encryption(enabled);
    }

    pub fn disable_encryption(&self) {
        self.engine.set_encryption(false);
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.engine.is_encryption_enabled()
    }

    pub fn public_key_base64(&self) -> String {
        self.keys.public_key_base64()
    }

    /// Learn a peer's public key
    pub fn update_keyring(&self, host_id: &str, public_key: &str) -> CoreResult<()> {
        self.keys.update_keyring(host_id, public_key)?;
        Ok(())
    }

    pub fn host_network_information(&self) -> HostNetworkInformation {
        HostNetworkInformation {
            host_name: self.host_name.clone(),
            is_encrypted: self.is_encryption_enabled(),
            public_ipv4_address: self.public_ipv4_address,
            network_interfaces: self.network_interfaces.clone(),
        }
    }

    pub async fn state(&self) -> EngineState {
        self.engine.state().await
    }

    pub fn stats(&self) -> EngineStats {
        self.engine.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::rule::Peer;
    use cladnet_network::tun::MemoryInterface;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn free_port() -> u16 {
        std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(dir: &TempDir) -> CoreConfig {
        CoreConfig {
            listen_address: Ipv4Addr::LOCALHOST,
            tunneling_port: free_port(),
            ..CoreConfig::local(dir.path())
        }
    }

    fn rule_with(host_id: &str) -> NetworkingRule {
        let mut rule = NetworkingRule::new("cladnet-1");
        rule.append_rule(
            Peer::new(host_id, "me")
                .with_cladnet_address("10.0.0.0/24".parse().unwrap(), Ipv4Addr::new(10, 0, 0, 2))
                .with_host_addresses(None, Some(Ipv4Addr::LOCALHOST)),
        );
        rule
    }

    #[tokio::test]
    async fn test_identity_survives_restart() {
        let dir = TempDir::new().unwrap();

        let (interface, _) = MemoryInterface::new();
        let first = HostAgent::new(config(&dir), interface).await.unwrap();
        let (interface, _) = MemoryInterface::new();
        let second = HostAgent::new(config(&dir), interface).await.unwrap();

        assert_eq!(first.host_id(), second.host_id());
        assert_eq!(first.public_key_base64(), second.public_key_base64());
        assert!(Uuid::parse_str(first.host_id()).is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_host_id_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(HOST_ID_FILE), "not-a-uuid").unwrap();

        assert!(matches!(
            load_or_create_host_id(dir.path()).await,
            Err(CoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.mtu = 100;

        let (interface, _) = MemoryInterface::new();
        assert!(matches!(
            HostAgent::new(config, interface).await,
            Err(CoreError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_configure_requires_row() {
        let dir = TempDir::new().unwrap();
        let (interface, _) = MemoryInterface::new();
        let agent = HostAgent::new(config(&dir), interface).await.unwrap();

        assert!(matches!(
            agent.configure_network_interface().await,
            Err(CoreError::HostNotInRule(_))
        ));

        // A row without a CLADNet address is not enough either
        let mut rule = NetworkingRule::new("cladnet-1");
        rule.append_rule(Peer::new(agent.host_id(), "me"));
        agent.set_networking_rule(rule).await;

        assert!(matches!(
            agent.configure_network_interface().await,
            Err(CoreError::HostNotInRule(_))
        ));
        assert_eq!(agent.state().await, EngineState::Unconfigured);
    }

    #[tokio::test]
    async fn test_configure_run_close() {
        let dir = TempDir::new().unwrap();
        let (interface, handle) = MemoryInterface::new();
        let agent = Arc::new(HostAgent::new(config(&dir), interface).await.unwrap());

        agent.update_networking_rule(rule_with(agent.host_id())).await;

        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { agent.start_tunneling().await })
        };

        agent.configure_network_interface().await.unwrap();
        assert_eq!(agent.state().await, EngineState::Tunneling);
        assert_eq!(
            handle.settings().await.unwrap().address,
            "10.0.0.2/24".parse::<ipnet::Ipv4Net>().unwrap()
        );

        agent.close_interface().await.unwrap();
        timeout(Duration::from_secs(5), runner).await.unwrap().unwrap().unwrap();
        assert_eq!(agent.state().await, EngineState::Released);
    }

    #[tokio::test]
    async fn test_host_network_information() {
        let dir = TempDir::new().unwrap();
        let (interface, _) = MemoryInterface::new();
        let agent = HostAgent::new(config(&dir), interface).await.unwrap();

        let info = agent.host_network_information();
        assert_eq!(info.public_ipv4_address, Some(Ipv4Addr::LOCALHOST));
        assert!(!info.is_encrypted);
        assert!(!info.host_name.is_empty());

        agent.enable_encryption(true);
        assert!(agent.host_network_information().is_encrypted);
        agent.disable_encryption();
        assert!(!agent.is_encryption_enabled());
    }

    #[tokio::test]
    async fn test_update_keyring() {
        let dir = TempDir::new().unwrap();
        let (interface, _) = MemoryInterface::new();
        let agent = HostAgent::new(config(&dir), interface).await.unwrap();

        let peer = KeyManager::generate("peer");
        agent.update_keyring("peer", &peer.public_key_base64()).unwrap();
        assert!(matches!(
            agent.update_keyring("peer", "%%%"),
            Err(CoreError::CryptoError(_))
        ));
    }

    #[tokio::test]
    async fn test_public_ip_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let config = CoreConfig {
            public_ip: None,
            public_ip_services: vec!["http://127.0.0.1:9/".to_string()],
            public_ip_timeout: Duration::from_millis(200),
            ..config(&dir)
        };

        let (interface, _) = MemoryInterface::new();
        let agent = HostAgent::new(config, interface).await.unwrap();
        assert_eq!(agent.host_network_information().public_ipv4_address, None);
    }
}
