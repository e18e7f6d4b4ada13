//! Virtual Interface Abstraction
//!
//! The tunneling engine only needs four things from the OS device: configure
//! it, read a packet, write a packet, close it. Implementations:
//! - Linux (using tun crate)
//! - In-memory (for tests and simulations, no OS device required)

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::NetworkResult;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

pub mod memory;
pub use memory::{MemoryInterface, MemoryInterfaceHandle};

/// Platform-agnostic virtual interface
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Create the device, set its MTU and address, and bring it up
    async fn configure(&self, name: &str, mtu: u16, address: Ipv4Net) -> NetworkResult<()>;

    /// Read one packet into `buf`, returning its length
    async fn read(&self, buf: &mut [u8]) -> NetworkResult<usize>;

    /// Write one packet, returning the number of bytes written
    async fn write(&self, packet: &[u8]) -> NetworkResult<usize>;

    /// Tear the device down; pending and later reads/writes fail
    async fn close(&self) -> NetworkResult<()>;
}

/// Create the virtual interface for the current platform
pub fn create_interface() -> NetworkResult<Arc<dyn VirtualInterface>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxTun::new()))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(crate::error::NetworkError::PlatformNotSupported)
    }
}
