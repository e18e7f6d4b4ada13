//! Core configuration

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::RuleType;

/// Smallest MTU every IPv4 host must accept
const MIN_MTU: u16 = 576;

/// Largest MTU that still fits the interface read buffer
const MAX_MTU: u16 = 1500;

/// Host agent and tunneling engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Virtual interface name
    pub interface_name: String,

    /// Virtual interface MTU
    pub mtu: u16,

    /// Address the UDP socket binds to
    pub listen_address: Ipv4Addr,

    /// UDP port used by every host of the CLADNet
    pub tunneling_port: u16,

    /// Destination selection policy
    pub rule_type: RuleType,

    /// Seal packets with the destination's public key
    pub encryption: bool,

    /// Directory holding `<host_id>/private.key` and `<host_id>/public.key`
    pub key_dir: PathBuf,

    /// Directory holding the persisted host id
    pub state_dir: PathBuf,

    /// Skip public IP inquiry and use this address
    pub public_ip: Option<Ipv4Addr>,

    /// Services asked for the public IP, in order
    pub public_ip_services: Vec<String>,

    /// Timeout for each public IP service
    #[serde(with = "duration_secs")]
    pub public_ip_timeout: Duration,

    /// UDP receive buffer size (None = OS default)
    pub recv_buffer_size: Option<usize>,

    /// UDP send buffer size (None = OS default)
    pub send_buffer_size: Option<usize>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            interface_name: crate::DEFAULT_INTERFACE_NAME.to_string(),
            mtu: crate::DEFAULT_MTU,
            listen_address: Ipv4Addr::UNSPECIFIED,
            tunneling_port: crate::DEFAULT_TUNNELING_PORT,
            rule_type: RuleType::Basic,
            encryption: false,
            key_dir: PathBuf::from("keys"),
            state_dir: PathBuf::from("."),
            public_ip: None,
            public_ip_services: cladnet_network::discovery::DEFAULT_PUBLIC_IP_SERVICES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            public_ip_timeout: Duration::from_secs(5),
            recv_buffer_size: Some(4 * 1024 * 1024),
            send_buffer_size: Some(4 * 1024 * 1024),
        }
    }
}

impl CoreConfig {
    /// Config for tests and local experiments: no public IP inquiry, given directories
    pub fn local(state_dir: impl Into<PathBuf>) -> Self {
        let state_dir = state_dir.into();
        Self {
            key_dir: state_dir.join("keys"),
            state_dir,
            public_ip: Some(Ipv4Addr::LOCALHOST),
            public_ip_services: Vec::new(),
            recv_buffer_size: None,
            send_buffer_size: None,
            ..Default::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.interface_name.is_empty() {
            return Err("Interface name must not be empty".into());
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(format!(
                "MTU {} outside {}..={}",
                self.mtu, MIN_MTU, MAX_MTU
            ));
        }
        if self.tunneling_port == 0 {
            return Err("Tunneling port must be set".into());
        }
        if self.public_ip.is_none() && self.public_ip_services.is_empty() {
            return Err("Either public_ip or public_ip_services must be set".into());
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
