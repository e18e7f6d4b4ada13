//! Tunneling socket
//!
//! One UDP socket bound to the tunneling port carries every datagram for
//! this host. The encapsulation and decapsulation loops share it through an
//! `Arc` without further locking.

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};
use crate::MAX_DATAGRAM_SIZE;

pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Bind with the kernel's default socket buffers
    pub fn bind(addr: SocketAddr) -> NetworkResult<Self> {
        UdpTransportBuilder::new(addr).build()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram; anything above the UDP limit is refused up front
    pub async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> NetworkResult<()> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::DatagramTooLarge {
                size: datagram.len(),
                max: MAX_DATAGRAM_SIZE,
            });
        }

        let sent = self.socket.send_to(datagram, addr).await?;
        trace!("{} -> {}: {} bytes", self.local_addr, addr, sent);
        Ok(())
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> NetworkResult<(usize, SocketAddr)> {
        let (len, from) = self.socket.recv_from(buf).await?;
        trace!("{} <- {}: {} bytes", self.local_addr, from, len);
        Ok((len, from))
    }
}

/// Socket options applied before binding
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl UdpTransportBuilder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    /// `SO_RCVBUF`; `None` keeps the kernel default
    pub fn recv_buffer_size(mut self, size: Option<usize>) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// `SO_SNDBUF`; `None` keeps the kernel default
    pub fn send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// Create, tune and bind the socket, then hand it to the runtime
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> NetworkResult<UdpTransport> {
        let socket = Socket::new(
            Domain::for_address(self.bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;

        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        socket.set_nonblocking(true)?;
        socket
            .bind(&self.bind_addr.into())
            .map_err(|e| bind_error(self.bind_addr, e))?;

        let socket = UdpSocket::from_std(socket.into())?;
        let local_addr = socket.local_addr()?;
        debug!(
            "Tunneling socket bound to {} (rcvbuf {:?}, sndbuf {:?})",
            local_addr, self.recv_buffer_size, self.send_buffer_size
        );

        Ok(UdpTransport { socket, local_addr })
    }
}

fn bind_error(addr: SocketAddr, e: io::Error) -> NetworkError {
    match e.kind() {
        io::ErrorKind::AddrInUse => NetworkError::AddressInUse(addr),
        _ => NetworkError::Io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_ephemeral_port_assigned() {
        let transport = UdpTransport::bind(loopback()).unwrap();
        assert!(transport.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_datagram_between_sockets() {
        let a = UdpTransportBuilder::new(loopback())
            .recv_buffer_size(Some(1 << 20))
            .send_buffer_size(Some(1 << 20))
            .build()
            .unwrap();
        let b = UdpTransport::bind(loopback()).unwrap();

        let datagram = [0x45u8, 0, 0, 20, 1, 2, 3, 4];
        a.send_to(&datagram, b.local_addr()).await.unwrap();

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();

        assert_eq!(from, a.local_addr());
        assert_eq!(&buf[..len], &datagram);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let first = UdpTransport::bind(loopback()).unwrap();

        let result = UdpTransport::bind(first.local_addr());
        assert!(matches!(result, Err(NetworkError::AddressInUse(addr)) if addr == first.local_addr()));
    }

    #[tokio::test]
    async fn test_oversized_datagram_refused() {
        let transport = UdpTransport::bind(loopback()).unwrap();

        let datagram = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        let result = transport.send_to(&datagram, transport.local_addr()).await;
        assert!(matches!(result, Err(NetworkError::DatagramTooLarge { .. })));
    }
}
