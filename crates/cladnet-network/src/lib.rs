//! CLADNet Network Layer
//!
//! Provides network primitives for the tunneling engine:
//! - Virtual interface abstraction (Linux TUN, in-memory)
//! - UDP transport carrying raw or sealed IP packets
//! - IPv4 header inspection
//! - Discovery of the host's public address and local networks

pub mod discovery;
pub mod error;
pub mod packet;
pub mod transport;
pub mod tun;

pub use discovery::{host_name, inquire_public_ipv4, local_network_interfaces, NetworkInterface};
pub use error::{NetworkError, NetworkResult};
pub use packet::Ipv4Header;
pub use transport::{UdpTransport, UdpTransportBuilder};
pub use tun::{create_interface, VirtualInterface};

/// Capacity of the buffer a packet is read into from the virtual interface
pub const INTERFACE_BUFFER_SIZE: usize = 1500;

/// Largest datagram accepted from the tunneling socket
pub const MAX_DATAGRAM_SIZE: usize = 65535;
