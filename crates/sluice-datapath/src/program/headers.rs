//! Wire header views used by classification
//!
//! Each header is decoded from a contiguous byte slice into a small `Copy`
//! struct with fields in host order. Decoding never reads past the slice.

use std::net::{Ipv4Addr, Ipv6Addr};

/// Ethernet II header length
pub const ETHERNET_HEADER_LEN: usize = 14;
/// IPv4 header length without options
pub const IPV4_HEADER_LEN: usize = 20;
/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;
/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;
/// TCP header length without options
pub const TCP_HEADER_LEN: usize = 20;
/// TCP header length with maximum options
pub const TCP_MAX_HEADER_LEN: usize = 60;

/// EtherType of IPv4
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType of IPv6
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// IP protocol number of TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number of UDP
pub const IPPROTO_UDP: u8 = 17;

/// TCP FIN flag
pub const TCP_FLAG_FIN: u8 = 0x01;
/// TCP SYN flag
pub const TCP_FLAG_SYN: u8 = 0x02;
/// TCP RST flag
pub const TCP_FLAG_RST: u8 = 0x04;

/// Longest connection ID a flow rule can match
pub const QUIC_MAX_CID_LENGTH: usize = 20;

/// Bytes needed to decode the largest matchable QUIC long header:
/// flags, version, DCID length, DCID, SCID length, SCID.
pub const QUIC_MAX_HEADER_LEN: usize = 1 + 4 + 1 + QUIC_MAX_CID_LENGTH + 1 + QUIC_MAX_CID_LENGTH;

const QUIC_LONG_HEADER_BIT: u8 = 0x80;
const QUIC_LONG_HEADER_DCID_LEN_OFFSET: usize = 5;

fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Ethernet II header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination MAC
    pub destination: [u8; 6],
    /// Source MAC
    pub source: [u8; 6],
    /// EtherType
    pub ether_type: u16,
}

impl EthernetHeader {
    /// Decode from at least [`ETHERNET_HEADER_LEN`] bytes
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ETHERNET_HEADER_LEN {
            return None;
        }
        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        destination.copy_from_slice(&bytes[0..6]);
        source.copy_from_slice(&bytes[6..12]);
        Some(Self {
            destination,
            source,
            ether_type: be16(bytes, 12),
        })
    }

    /// MAC addresses swapped, as the first 12 header bytes
    pub fn swapped_addresses(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..6].copy_from_slice(&self.source);
        out[6..12].copy_from_slice(&self.destination);
        out
    }
}

/// IPv4 header fields used by classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Header length in 32-bit words
    pub header_length: u8,
    /// Transport protocol
    pub protocol: u8,
    /// Source address
    pub source: Ipv4Addr,
    /// Destination address
    pub destination: Ipv4Addr,
}

impl Ipv4Header {
    /// Decode from at least [`IPV4_HEADER_LEN`] bytes
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < IPV4_HEADER_LEN {
            return None;
        }
        Some(Self {
            header_length: bytes[0] & 0x0f,
            protocol: bytes[9],
            source: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
            destination: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
        })
    }

    /// Header length in bytes
    pub fn header_bytes(&self) -> usize {
        usize::from(self.header_length) * 4
    }
}

/// IPv6 fixed header fields used by classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Header {
    /// Next header (extension headers are not walked)
    pub next_header: u8,
    /// Source address
    pub source: Ipv6Addr,
    /// Destination address
    pub destination: Ipv6Addr,
}

impl Ipv6Header {
    /// Decode from at least [`IPV6_HEADER_LEN`] bytes
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < IPV6_HEADER_LEN {
            return None;
        }
        let mut source = [0u8; 16];
        let mut destination = [0u8; 16];
        source.copy_from_slice(&bytes[8..24]);
        destination.copy_from_slice(&bytes[24..40]);
        Some(Self {
            next_header: bytes[6],
            source: Ipv6Addr::from(source),
            destination: Ipv6Addr::from(destination),
        })
    }
}

/// UDP header ports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
}

impl UdpHeader {
    /// Decode from at least [`UDP_HEADER_LEN`] bytes
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < UDP_HEADER_LEN {
            return None;
        }
        Some(Self {
            source_port: be16(bytes, 0),
            destination_port: be16(bytes, 2),
        })
    }
}

/// TCP header fields used by classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
    /// Data offset in 32-bit words
    pub data_offset: u8,
    /// Flag byte (CWR..FIN)
    pub flags: u8,
}

impl TcpHeader {
    /// Decode the fixed part from at least [`TCP_HEADER_LEN`] bytes
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TCP_HEADER_LEN {
            return None;
        }
        Some(Self {
            source_port: be16(bytes, 0),
            destination_port: be16(bytes, 2),
            data_offset: bytes[12] >> 4,
            flags: bytes[13],
        })
    }

    /// Header length including options, in bytes
    pub fn header_bytes(&self) -> usize {
        usize::from(self.data_offset) * 4
    }

    /// Whether SYN, FIN or RST is set
    pub fn is_control(&self) -> bool {
        self.flags & (TCP_FLAG_SYN | TCP_FLAG_FIN | TCP_FLAG_RST) != 0
    }
}

/// Connection ID view of a QUIC header
///
/// Long headers expose the source CID, short headers the destination CID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicHeader {
    /// Long header form
    pub is_long_header: bool,
    /// CID length as carried on the wire
    pub cid_length: u8,
    /// First bytes of the CID
    pub cid: [u8; QUIC_MAX_CID_LENGTH],
}

impl QuicHeader {
    /// Decode from the start of a transport payload
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let first = *bytes.first()?;
        let mut cid = [0u8; QUIC_MAX_CID_LENGTH];

        if first & QUIC_LONG_HEADER_BIT != 0 {
            let dcid_len = usize::from(*bytes.get(QUIC_LONG_HEADER_DCID_LEN_OFFSET)?);
            let scid_len_at = QUIC_LONG_HEADER_DCID_LEN_OFFSET + 1 + dcid_len;
            let scid_len = *bytes.get(scid_len_at)?;
            let scid = bytes.get(scid_len_at + 1..scid_len_at + 1 + usize::from(scid_len))?;
            let keep = scid.len().min(QUIC_MAX_CID_LENGTH);
            cid[..keep].copy_from_slice(&scid[..keep]);
            return Some(Self {
                is_long_header: true,
                cid_length: scid_len,
                cid,
            });
        }

        // Short header CIDs carry no length; only a full-width CID is usable.
        let dcid = bytes.get(1..1 + QUIC_MAX_CID_LENGTH)?;
        cid.copy_from_slice(dcid);
        Some(Self {
            is_long_header: false,
            cid_length: QUIC_MAX_CID_LENGTH as u8,
            cid,
        })
    }

    /// Whether `cid_length` bytes at `cid_offset` equal `data`
    pub fn cid_matches(&self, cid_offset: u8, data: &[u8]) -> bool {
        let start = usize::from(cid_offset);
        let end = start + data.len();
        if end > QUIC_MAX_CID_LENGTH || usize::from(self.cid_length) < end {
            return false;
        }
        self.cid[start..end] == *data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ethernet_parse_and_swap() {
        let bytes = hex::decode("ffffffffffff0200000000010800").unwrap();
        let eth = EthernetHeader::parse(&bytes).unwrap();
        assert_eq!(eth.ether_type, ETHERTYPE_IPV4);
        assert_eq!(eth.source, [2, 0, 0, 0, 0, 1]);

        let swapped = eth.swapped_addresses();
        assert_eq!(&swapped[0..6], &[2, 0, 0, 0, 0, 1]);
        assert_eq!(&swapped[6..12], &[0xff; 6]);
        assert!(EthernetHeader::parse(&bytes[..13]).is_none());
    }

    #[test]
    fn test_ipv4_parse() {
        let bytes = hex::decode("4500001c0000000040110000c0a80001c0a80002").unwrap();
        let ip = Ipv4Header::parse(&bytes).unwrap();
        assert_eq!(ip.header_bytes(), 20);
        assert_eq!(ip.protocol, IPPROTO_UDP);
        assert_eq!(ip.destination, Ipv4Addr::new(192, 168, 0, 2));
    }

    #[test]
    fn test_tcp_control_flags() {
        let mut bytes = [0u8; 20];
        bytes[2..4].copy_from_slice(&443u16.to_be_bytes());
        bytes[12] = 5 << 4;
        bytes[13] = TCP_FLAG_SYN;
        let tcp = TcpHeader::parse(&bytes).unwrap();
        assert_eq!(tcp.destination_port, 443);
        assert_eq!(tcp.header_bytes(), 20);
        assert!(tcp.is_control());

        bytes[13] = 0x10; // ACK
        assert!(!TcpHeader::parse(&bytes).unwrap().is_control());
    }

    #[test]
    fn test_quic_long_header_uses_source_cid() {
        // flags, version, dcid_len=2, dcid, scid_len=8, scid
        let mut bytes = vec![0xc0, 0, 0, 0, 1, 2, 0xaa, 0xbb, 8];
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let quic = QuicHeader::parse(&bytes).unwrap();
        assert!(quic.is_long_header);
        assert_eq!(quic.cid_length, 8);
        assert!(quic.cid_matches(0, &[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(quic.cid_matches(4, &[5, 6]));
        assert!(!quic.cid_matches(4, &[5, 6, 7, 8, 9]));

        // SCID truncated on the wire
        assert!(QuicHeader::parse(&bytes[..15]).is_none());
    }

    #[test]
    fn test_quic_short_header_needs_full_cid() {
        let mut bytes = vec![0x40];
        bytes.extend(1..=20u8);
        let quic = QuicHeader::parse(&bytes).unwrap();
        assert!(!quic.is_long_header);
        assert_eq!(quic.cid_length, 20);
        assert!(quic.cid_matches(18, &[19, 20]));

        assert!(QuicHeader::parse(&bytes[..20]).is_none());
        assert!(QuicHeader::parse(&[]).is_none());
    }
}
