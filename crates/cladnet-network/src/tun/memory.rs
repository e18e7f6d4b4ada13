//! In-memory virtual interface
//!
//! Behaves like a TUN device whose "kernel side" is a pair of channels held by
//! a [`MemoryInterfaceHandle`]: packets injected through the handle are what
//! the engine reads, packets the engine writes come out of the handle.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::debug;

use super::VirtualInterface;
use crate::error::{NetworkError, NetworkResult};

/// Settings the interface was configured with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    pub name: String,
    pub mtu: u16,
    pub address: Ipv4Net,
}

/// Channel-backed virtual interface
pub struct MemoryInterface {
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    settings: Arc<Mutex<Option<InterfaceSettings>>>,
    closed: watch::Sender<bool>,
}

/// Test-side end of a [`MemoryInterface`]
pub struct MemoryInterfaceHandle {
    inject: mpsc::UnboundedSender<Vec<u8>>,
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    settings: Arc<Mutex<Option<InterfaceSettings>>>,
    closed: watch::Receiver<bool>,
}

impl MemoryInterface {
    /// Create an interface and the handle driving it
    pub fn new() -> (Arc<Self>, MemoryInterfaceHandle) {
        let (inject, inbound) = mpsc::unbounded_channel();
        let (outbound, written) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);
        let settings = Arc::new(Mutex::new(None));

        let interface = Arc::new(Self {
            inbound: Mutex::new(inbound),
            outbound,
            settings: Arc::clone(&settings),
            closed,
        });

        let handle = MemoryInterfaceHandle {
            inject,
            written,
            settings,
            closed: closed_rx,
        };

        (interface, handle)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl VirtualInterface for MemoryInterface {
    async fn configure(&self, name: &str, mtu: u16, address: Ipv4Net) -> NetworkResult<()> {
        if self.is_closed() {
            return Err(NetworkError::InterfaceClosed);
        }

        *self.settings.lock().await = Some(InterfaceSettings {
            name: name.to_string(),
            mtu,
            address,
        });
        debug!("Configured in-memory interface {} with IP {}", name, address);
        Ok(())
    }

    async fn read(&self, buf: &mut [u8]) -> NetworkResult<usize> {
        if self.settings.lock().await.is_none() {
            return Err(NetworkError::NotConfigured);
        }

        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        let closing = async {
            let _ = closed.wait_for(|closed| *closed).await;
        };

        let packet = tokio::select! {
            packet = inbound.recv() => packet.ok_or(NetworkError::InterfaceClosed)?,
            _ = closing => return Err(NetworkError::InterfaceClosed),
        };

        if packet.len() > buf.len() {
            return Err(NetworkError::InvalidPacket(format!(
                "{} byte packet does not fit a {} byte buffer",
                packet.len(),
                buf.len()
            )));
        }

        buf[..packet.len()].copy_from_slice(&packet);
        Ok(packet.len())
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<usize> {
        if self.is_closed() {
            return Err(NetworkError::InterfaceClosed);
        }
        if self.settings.lock().await.is_none() {
            return Err(NetworkError::NotConfigured);
        }

        self.outbound
            .send(packet.to_vec())
            .map_err(|_| NetworkError::InterfaceClosed)?;
        Ok(packet.len())
    }

    async fn close(&self) -> NetworkResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

impl MemoryInterfaceHandle {
    /// Hand a packet to the interface as if the OS routed it there
    pub fn inject(&self, packet: impl Into<Vec<u8>>) -> bool {
        self.inject.send(packet.into()).is_ok()
    }

    /// Next packet written to the interface by the engine
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Packet written to the interface, if one is already waiting
    pub fn try_next_written(&mut self) -> Option<Vec<u8>> {
        self.written.try_recv().ok()
    }

    /// Settings from the last `configure` call
    pub async fn settings(&self) -> Option<InterfaceSettings> {
        self.settings.lock().await.clone()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
