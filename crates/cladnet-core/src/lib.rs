//! CLADNet Core
//!
//! Implements the per-host tunneling engine of a Cloud Adaptive Network:
//! - Networking rule (peer table) and its concurrent registry
//! - Destination selection between a peer's private and public address
//! - Private address space recommendation for new CLADNets
//! - Encapsulation/decapsulation loops between the virtual interface and UDP
//! - The host agent composing all of the above

pub mod address_space;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod policy;
pub mod registry;
pub mod rule;

pub use address_space::{get_available_ipv4_private_address_spaces, AvailableIpv4PrivateAddressSpaces};
pub use config::CoreConfig;
pub use engine::{EngineState, EngineStats, TunnelingEngine};
pub use error::{CoreError, CoreResult};
pub use host::{HostAgent, HostNetworkInformation};
pub use policy::{select_destination, CloudProvider, RuleType};
pub use registry::{PeerRegistry, Route};
pub use rule::{CloudInformation, NetworkingRule, Peer, PeerState};

/// Default UDP port the tunnel listens on
pub const DEFAULT_TUNNELING_PORT: u16 = 8055;

/// Default MTU configured on the virtual interface, leaving room for encapsulation
pub const DEFAULT_MTU: u16 = 1300;

/// Default virtual interface name
pub const DEFAULT_INTERFACE_NAME: &str = "cladnet0";
