//! Network error types

use std::net::SocketAddr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Creating or configuring the OS device failed
    #[error("TUN device error: {0}")]
    TunError(String),

    /// `read`/`write` before `configure`
    #[error("Virtual interface is not configured")]
    NotConfigured,

    /// The interface was closed, locally or underneath us
    #[error("Virtual interface is closed")]
    InterfaceClosed,

    /// Not an IPv4 packet, or a truncated header
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Address already in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("Datagram of {size} bytes exceeds the {max} byte limit")]
    DatagramTooLarge { size: usize, max: usize },

    /// No public-IP service returned a usable address
    #[error("Public IP inquiry failed: {0}")]
    PublicIpUnavailable(String),

    #[error("Platform not supported for this operation")]
    PlatformNotSupported,
}

pub type NetworkResult<T> = Result<T, NetworkError>;
