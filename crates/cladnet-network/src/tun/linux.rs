//! Linux TUN device implementation

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::VirtualInterface;
use crate::error::{NetworkError, NetworkResult};

/// Linux TUN device
///
/// The device is split so the encapsulation side can block in `read` while
/// the decapsulation side writes.
pub struct LinuxTun {
    reader: Mutex<Option<ReadHalf<tun::AsyncDevice>>>,
    writer: Mutex<Option<WriteHalf<tun::AsyncDevice>>>,
    name: Mutex<Option<String>>,
}

impl LinuxTun {
    /// Create an unconfigured device handle
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            name: Mutex::new(None),
        }
    }
}

impl Default for LinuxTun {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VirtualInterface for LinuxTun {
    async fn configure(&self, name: &str, mtu: u16, address: Ipv4Net) -> NetworkResult<()> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .name(name)
            .address(address.addr())
            .netmask(address.netmask())
            .mtu(mtu as i32)
            .up();

        // Raw IP packets, no packet info header
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config).map_err(|e| {
            NetworkError::TunError(format!("Failed to create TUN device: {}", e))
        })?;

        let (reader, writer) = tokio::io::split(device);
        *self.reader.lock().await = Some(reader);
        *self.writer.lock().await = Some(writer);
        *self.name.lock().await = Some(name.to_string());

        info!("Created TUN device: {} with IP {} (mtu {})", name, address, mtu);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> NetworkResult<usize> {
        let mut reader = self.reader.lock().await;
        let reader = reader.as_mut().ok_or(NetworkError::NotConfigured)?;

        let n = reader.read(buf).await.map_err(|e| {
            NetworkError::TunError(format!("Failed to read from TUN: {}", e))
        })?;

        if n == 0 {
            return Err(NetworkError::InterfaceClosed);
        }
        Ok(n)
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<usize> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(NetworkError::NotConfigured)?;

        writer.write_all(packet).await.map_err(|e| {
            NetworkError::TunError(format!("Failed to write to TUN: {}", e))
        })?;

        Ok(packet.len())
    }

    async fn close(&self) -> NetworkResult<()> {
        // Callers stop reading before closing; the device goes away once both halves drop
        let name = self.name.lock().await.take();
        self.writer.lock().await.take();
        self.reader.lock().await.take();

        debug!("Closed TUN device: {}", name.unwrap_or_default());
        Ok(())
    }
}
