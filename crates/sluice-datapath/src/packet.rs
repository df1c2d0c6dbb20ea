//! Synthetic frame construction
//!
//! Builds Ethernet frames with IPv4/IPv6 and UDP/TCP headers for injection
//! into a software interface. Checksums are filled for IPv4 headers only;
//! transport checksums are left zero since nothing on the receive path
//! verifies them.

use crate::program::headers::{
    ETHERNET_HEADER_LEN, ETHERTYPE_IPV4, ETHERTYPE_IPV6, IPPROTO_TCP, IPPROTO_UDP,
    IPV4_HEADER_LEN, IPV6_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN,
};
use std::net::{SocketAddrV4, SocketAddrV6};

/// Default source MAC of built frames
pub const DEFAULT_SOURCE_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
/// Default destination MAC of built frames
pub const DEFAULT_DESTINATION_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];

#[derive(Debug, Clone)]
enum Network {
    Ipv4 {
        source: SocketAddrV4,
        destination: SocketAddrV4,
    },
    Ipv6 {
        source: SocketAddrV6,
        destination: SocketAddrV6,
    },
    Raw(u16),
}

#[derive(Debug, Clone, Copy)]
enum Transport {
    Udp,
    Tcp { flags: u8, options: u8 },
}

/// Builder for one Ethernet frame
#[derive(Debug, Clone)]
pub struct PacketBuilder {
    source_mac: [u8; 6],
    destination_mac: [u8; 6],
    network: Network,
    transport: Transport,
    payload: Vec<u8>,
}

impl PacketBuilder {
    fn with(network: Network, transport: Transport) -> Self {
        Self {
            source_mac: DEFAULT_SOURCE_MAC,
            destination_mac: DEFAULT_DESTINATION_MAC,
            network,
            transport,
            payload: Vec::new(),
        }
    }

    /// UDP over IPv4
    pub fn udp_v4(source: SocketAddrV4, destination: SocketAddrV4) -> Self {
        Self::with(Network::Ipv4 { source, destination }, Transport::Udp)
    }

    /// UDP over IPv6
    pub fn udp_v6(source: SocketAddrV6, destination: SocketAddrV6) -> Self {
        Self::with(Network::Ipv6 { source, destination }, Transport::Udp)
    }

    /// TCP over IPv4 with the given flag byte
    pub fn tcp_v4(source: SocketAddrV4, destination: SocketAddrV4, flags: u8) -> Self {
        Self::with(
            Network::Ipv4 { source, destination },
            Transport::Tcp { flags, options: 0 },
        )
    }

    /// TCP over IPv6 with the given flag byte
    pub fn tcp_v6(source: SocketAddrV6, destination: SocketAddrV6, flags: u8) -> Self {
        Self::with(
            Network::Ipv6 { source, destination },
            Transport::Tcp { flags, options: 0 },
        )
    }

    /// Bare Ethernet frame with an arbitrary EtherType
    pub fn ethernet(ether_type: u16) -> Self {
        Self::with(Network::Raw(ether_type), Transport::Udp)
    }

    /// Override MAC addresses
    pub fn macs(mut self, source: [u8; 6], destination: [u8; 6]) -> Self {
        self.source_mac = source;
        self.destination_mac = destination;
        self
    }

    /// Pad the TCP header with `words` 32-bit NOP option words (max 10)
    pub fn tcp_options(mut self, words: u8) -> Self {
        if let Transport::Tcp { flags, .. } = self.transport {
            self.transport = Transport::Tcp {
                flags,
                options: words.min(10),
            };
        }
        self
    }

    /// Transport payload
    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }

    fn transport_header(&self, source_port: u16, destination_port: u16) -> Vec<u8> {
        match self.transport {
            Transport::Udp => {
                let length = (UDP_HEADER_LEN + self.payload.len()) as u16;
                let mut header = Vec::with_capacity(UDP_HEADER_LEN);
                header.extend_from_slice(&source_port.to_be_bytes());
                header.extend_from_slice(&destination_port.to_be_bytes());
                header.extend_from_slice(&length.to_be_bytes());
                header.extend_from_slice(&[0, 0]);
                header
            }
            Transport::Tcp { flags, options } => {
                let header_len = TCP_HEADER_LEN + usize::from(options) * 4;
                let mut header = vec![0u8; header_len];
                header[0..2].copy_from_slice(&source_port.to_be_bytes());
                header[2..4].copy_from_slice(&destination_port.to_be_bytes());
                header[12] = ((header_len / 4) as u8) << 4;
                header[13] = flags;
                header[14..16].copy_from_slice(&0xffffu16.to_be_bytes());
                for option in header[TCP_HEADER_LEN..].iter_mut() {
                    *option = 1; // NOP
                }
                header
            }
        }
    }

    fn protocol(&self) -> u8 {
        match self.transport {
            Transport::Udp => IPPROTO_UDP,
            Transport::Tcp { .. } => IPPROTO_TCP,
        }
    }

    /// Serialize the frame
    pub fn build(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + 64 + self.payload.len());
        frame.extend_from_slice(&self.destination_mac);
        frame.extend_from_slice(&self.source_mac);

        match &self.network {
            Network::Raw(ether_type) => {
                frame.extend_from_slice(&ether_type.to_be_bytes());
                frame.extend_from_slice(&self.payload);
            }
            Network::Ipv4 {
                source,
                destination,
            } => {
                let transport = self.transport_header(source.port(), destination.port());
                let total = (IPV4_HEADER_LEN + transport.len() + self.payload.len()) as u16;
                let mut ip = [0u8; IPV4_HEADER_LEN];
                ip[0] = 0x45;
                ip[2..4].copy_from_slice(&total.to_be_bytes());
                ip[8] = 64;
                ip[9] = self.protocol();
                ip[12..16].copy_from_slice(&source.ip().octets());
                ip[16..20].copy_from_slice(&destination.ip().octets());
                let checksum = ipv4_checksum(&ip);
                ip[10..12].copy_from_slice(&checksum.to_be_bytes());

                frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
                frame.extend_from_slice(&ip);
                frame.extend_from_slice(&transport);
                frame.extend_from_slice(&self.payload);
            }
            Network::Ipv6 {
                source,
                destination,
            } => {
                let transport = self.transport_header(source.port(), destination.port());
                let payload_len = (transport.len() + self.payload.len()) as u16;
                let mut ip = [0u8; IPV6_HEADER_LEN];
                ip[0] = 0x60;
                ip[4..6].copy_from_slice(&payload_len.to_be_bytes());
                ip[6] = self.protocol();
                ip[7] = 64;
                ip[8..24].copy_from_slice(&source.ip().octets());
                ip[24..40].copy_from_slice(&destination.ip().octets());

                frame.extend_from_slice(&ETHERTYPE_IPV6.to_be_bytes());
                frame.extend_from_slice(&ip);
                frame.extend_from_slice(&transport);
                frame.extend_from_slice(&self.payload);
            }
        }
        frame
    }
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|word| u32::from(u16::from_be_bytes([word[0], word[1]])))
        .sum();
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// QUIC long header prefix (Initial, version 1) carrying the given CIDs
pub fn quic_long_header(dcid: &[u8], scid: &[u8]) -> Vec<u8> {
    let mut header = vec![0xc0, 0x00, 0x00, 0x00, 0x01];
    header.push(dcid.len() as u8);
    header.extend_from_slice(dcid);
    header.push(scid.len() as u8);
    header.extend_from_slice(scid);
    header
}

/// QUIC short header prefix carrying the given destination CID
pub fn quic_short_header(dcid: &[u8]) -> Vec<u8> {
    let mut header = vec![0x40];
    header.extend_from_slice(dcid);
    header
}

/// Split `frame` into buffers at the given ascending offsets
pub fn split_at(frame: &[u8], points: &[usize]) -> Vec<Vec<u8>> {
    let mut parts = Vec::with_capacity(points.len() + 1);
    let mut start = 0;
    for &point in points {
        let point = point.clamp(start, frame.len());
        parts.push(frame[start..point].to_vec());
        start = point;
    }
    parts.push(frame[start..].to_vec());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_udp_v4_layout() {
        let frame = PacketBuilder::udp_v4(
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 4000),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 53),
        )
        .payload(b"hello")
        .build();

        assert_eq!(frame.len(), 14 + 20 + 8 + 5);
        assert_eq!(&frame[12..14], &[0x08, 0x00]);
        assert_eq!(frame[14 + 9], IPPROTO_UDP);
        assert_eq!(&frame[14 + 20 + 2..14 + 20 + 4], &53u16.to_be_bytes());
        // A valid header sums to zero.
        assert_eq!(ipv4_checksum(&frame[14..34]), 0);
    }

    #[test]
    fn test_tcp_options_extend_header() {
        let frame = PacketBuilder::tcp_v4(
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 2),
            0x02,
        )
        .tcp_options(3)
        .build();
        assert_eq!(frame.len(), 14 + 20 + 32);
        assert_eq!(frame[14 + 20 + 12] >> 4, 8);
    }

    #[test]
    fn test_split_at() {
        let parts = split_at(b"abcdef", &[2, 2, 5]);
        assert_eq!(parts, vec![b"ab".to_vec(), vec![], b"cde".to_vec(), b"f".to_vec()]);
        assert_eq!(split_at(b"abc", &[]), vec![b"abc".to_vec()]);
    }
}
