//! IPv4 header inspection
//!
//! The tunnel adds no framing of its own; the IPv4 header inside the payload
//! is the only structure looked at.

use std::net::Ipv4Addr;

use crate::error::{NetworkError, NetworkResult};

/// Minimum IPv4 header length (no options)
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// The fields of an IPv4 header the engine cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in bytes (IHL * 4)
    pub header_len: usize,
    /// Total length from the header
    pub total_len: u16,
    pub ttl: u8,
    /// Transport protocol number (6 = TCP, 17 = UDP, 1 = ICMP)
    pub protocol: u8,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Parse the header at the start of `packet`
    pub fn parse(packet: &[u8]) -> NetworkResult<Self> {
        if packet.len() < IPV4_MIN_HEADER_LEN {
            return Err(NetworkError::InvalidPacket(format!(
                "Packet too short for IPv4: {} bytes",
                packet.len()
            )));
        }

        let version = packet[0] >> 4;
        if version != 4 {
            return Err(NetworkError::InvalidPacket(format!(
                "Not an IPv4 packet: version {}",
                version
            )));
        }

        let header_len = ((packet[0] & 0x0F) as usize) * 4;
        if header_len < IPV4_MIN_HEADER_LEN || header_len > packet.len() {
            return Err(NetworkError::InvalidPacket(format!(
                "Bad IPv4 header length: {}",
                header_len
            )));
        }

        Ok(Self {
            header_len,
            total_len: u16::from_be_bytes([packet[2], packet[3]]),
            ttl: packet[8],
            protocol: packet[9],
            source: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
            destination: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        })
    }
}

/// Get destination IP from an IPv4 packet
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    Ipv4Header::parse(packet).ok().map(|header| header.destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal IPv4/UDP packet from `src` to `dst` carrying `payload`
    fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let total = (IPV4_MIN_HEADER_LEN + payload.len()) as u16;
        let mut packet = vec![0x45, 0x00];
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 0, 64, 17, 0, 0]);
        packet.extend_from_slice(&src.octets());
        packet.extend_from_slice(&dst.octets());
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_parse_ipv4_header() {
        let packet = ipv4_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            Ipv4Addr::new(10, 0, 0, 3),
            b"hello",
        );
        let header = Ipv4Header::parse(&packet).unwrap();

        assert_eq!(header.header_len, 20);
        assert_eq!(header.total_len, 25);
        assert_eq!(header.protocol, 17);
        assert_eq!(header.ttl, 64);
        assert_eq!(header.source, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(header.destination, Ipv4Addr::new(10, 0, 0, 3));
    }

    #[test]
    fn test_header_with_options() {
        let mut packet = ipv4_packet(Ipv4Addr::LOCALHOST, Ipv4Addr::new(10, 0, 0, 9), &[]);
        packet[0] = 0x46;
        packet.extend_from_slice(&[0, 0, 0, 0]);

        let header = Ipv4Header::parse(&packet).unwrap();
        assert_eq!(header.header_len, 24);
        assert_eq!(header.destination, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn test_rejects_ipv6() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;

        assert!(Ipv4Header::parse(&packet).is_err());
        assert_eq!(ipv4_destination(&packet), None);
    }

    #[test]
    fn test_rejects_short_and_bad_ihl() {
        assert!(Ipv4Header::parse(&[0x45, 0, 0]).is_err());

        let mut packet = ipv4_packet(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, &[]);
        packet[0] = 0x44;
        assert!(Ipv4Header::parse(&packet).is_err());

        packet[0] = 0x4F;
        assert!(Ipv4Header::parse(&packet).is_err());
    }
}
