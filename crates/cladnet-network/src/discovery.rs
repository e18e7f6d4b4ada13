//! Host network discovery
//!
//! Finds the address the outside world sees for this host and the private
//! networks its interfaces sit on. The control plane uses both to allocate a
//! CLADNet address that does not collide with anything local.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{NetworkError, NetworkResult};

/// Default services answering with the caller's public address as plain text
pub const DEFAULT_PUBLIC_IP_SERVICES: &[&str] = &[
    "https://api.ipify.org",
    "https://ifconfig.co/ip",
    "https://icanhazip.com",
    "https://ifconfig.me/ip",
];

/// A local network interface and its IPv4 networks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub ipv4_cidrs: Vec<Ipv4Net>,
}

/// Ask each service in turn until one returns a parseable IPv4 address
pub async fn inquire_public_ipv4(
    services: &[String],
    timeout: Duration,
) -> NetworkResult<Ipv4Addr> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NetworkError::PublicIpUnavailable(e.to_string()))?;

    for service in services {
        let body = match client.get(service).send().await {
            Ok(response) => response.text().await,
            Err(e) => Err(e),
        };

        match body {
            Ok(text) => match text.trim().parse::<Ipv4Addr>() {
                Ok(ip) => {
                    debug!("Public IP {} reported by {}", ip, service);
                    return Ok(ip);
                }
                Err(_) => debug!("Unparseable public IP from {}: {:?}", service, text.trim()),
            },
            Err(e) => warn!("Public IP service {} failed: {}", service, e),
        }
    }

    Err(NetworkError::PublicIpUnavailable(format!(
        "none of {} services answered",
        services.len()
    )))
}

/// Name this host reports to the control plane
pub fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// The RFC 1918 block `addr/prefix` belongs to, if any
fn private_block(addr: IpAddr, prefix: u8) -> Option<Ipv4Net> {
    match addr {
        IpAddr::V4(addr) if addr.is_private() => {
            Ipv4Net::new(addr, prefix).ok().map(|net| net.trunc())
        }
        _ => None,
    }
}

/// Enumerate local interfaces with their private IPv4 blocks
pub fn local_network_interfaces() -> Vec<NetworkInterface> {
    let networks = sysinfo::Networks::new_with_refreshed_list();
    let mut interfaces = Vec::new();

    for (interface_name, data) in networks.iter() {
        let ipv4_cidrs: Vec<Ipv4Net> = data
            .ip_networks()
            .iter()
            .filter_map(|network| private_block(network.addr, network.prefix))
            .collect();

        if ipv4_cidrs.is_empty() {
            continue;
        }

        interfaces.push(NetworkInterface {
            name: interface_name.clone(),
            ipv4_cidrs,
        });
    }

    interfaces.sort_by(|a, b| a.name.cmp(&b.name));
    interfaces
}
