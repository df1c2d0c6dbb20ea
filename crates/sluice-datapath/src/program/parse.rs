//! Lazy per-frame header parsing
//!
//! Headers are decoded once per frame on first use and cached. A header that
//! lies entirely inside one buffer is read in place; one that straddles a
//! buffer boundary is gathered into [`FrameStorage`] first. Parsing stops at
//! the first header that is missing, truncated or unsupported, leaving the
//! remaining headers invalid.

use super::headers::*;
use sluice_core::FrameBuffers;

/// Scratch space for headers that straddle buffers
pub(crate) struct FrameStorage {
    header: [u8; TCP_MAX_HEADER_LEN],
    quic: [u8; QUIC_MAX_HEADER_LEN],
}

impl FrameStorage {
    pub(crate) fn new() -> Self {
        Self {
            header: [0; TCP_MAX_HEADER_LEN],
            quic: [0; QUIC_MAX_HEADER_LEN],
        }
    }
}

/// Bytes `[offset, offset + len)` of the frame, in place when one buffer
/// holds them all, otherwise gathered into `scratch`
fn contiguous<'x>(
    frame: &'x FrameBuffers<'_>,
    offset: usize,
    len: usize,
    scratch: &'x mut [u8],
    copies: &mut u64,
) -> Option<&'x [u8]> {
    let mut start = offset;
    for index in 0..frame.buffer_count() {
        let data = frame.data(index);
        if start < data.len() {
            if data.len() - start >= len {
                return Some(&data[start..start + len]);
            }
            break;
        }
        start -= data.len();
    }

    let dst = scratch.get_mut(..len)?;
    if frame.read_at(offset, dst) != len {
        return None;
    }
    *copies += 1;
    Some(dst)
}

/// Bytes from `offset` to the end of the buffer holding it
fn remaining_in_buffer<'x>(frame: &'x FrameBuffers<'_>, offset: usize) -> &'x [u8] {
    let mut start = offset;
    for index in 0..frame.buffer_count() {
        let data = frame.data(index);
        if start < data.len() {
            return &data[start..];
        }
        start -= data.len();
    }
    &[]
}

/// Headers decoded from one frame
#[derive(Debug, Default)]
pub(crate) struct FrameCache {
    /// Ethernet through transport parse attempted
    pub parsed: bool,
    pub ethernet: Option<EthernetHeader>,
    pub ipv4: Option<Ipv4Header>,
    pub ipv6: Option<Ipv6Header>,
    pub udp: Option<UdpHeader>,
    pub tcp: Option<TcpHeader>,
    /// Frame offset of the transport payload
    pub payload_offset: Option<usize>,
    /// QUIC parse attempted
    pub quic_parsed: bool,
    pub quic: Option<QuicHeader>,
}

impl FrameCache {
    /// Decode Ethernet through UDP or TCP
    pub(crate) fn parse(
        &mut self,
        frame: &FrameBuffers<'_>,
        storage: &mut FrameStorage,
        copies: &mut u64,
    ) {
        self.parsed = true;
        let scratch = &mut storage.header;

        let Some(eth) = contiguous(frame, 0, ETHERNET_HEADER_LEN, scratch, copies)
            .and_then(EthernetHeader::parse)
        else {
            return;
        };
        self.ethernet = Some(eth);
        let mut offset = ETHERNET_HEADER_LEN;

        let protocol = match eth.ether_type {
            ETHERTYPE_IPV4 => {
                let Some(ip) = contiguous(frame, offset, IPV4_HEADER_LEN, scratch, copies)
                    .and_then(Ipv4Header::parse)
                else {
                    return;
                };
                // Options are not walked.
                if ip.header_bytes() != IPV4_HEADER_LEN {
                    return;
                }
                self.ipv4 = Some(ip);
                offset += IPV4_HEADER_LEN;
                ip.protocol
            }
            ETHERTYPE_IPV6 => {
                let Some(ip) = contiguous(frame, offset, IPV6_HEADER_LEN, scratch, copies)
                    .and_then(Ipv6Header::parse)
                else {
                    return;
                };
                self.ipv6 = Some(ip);
                offset += IPV6_HEADER_LEN;
                ip.next_header
            }
            _ => return,
        };

        match protocol {
            IPPROTO_UDP => {
                let Some(udp) = contiguous(frame, offset, UDP_HEADER_LEN, scratch, copies)
                    .and_then(UdpHeader::parse)
                else {
                    return;
                };
                self.udp = Some(udp);
                self.payload_offset = Some(offset + UDP_HEADER_LEN);
            }
            IPPROTO_TCP => {
                let Some(tcp) = contiguous(frame, offset, TCP_HEADER_LEN, scratch, copies)
                    .and_then(TcpHeader::parse)
                else {
                    return;
                };
                let header_len = tcp.header_bytes();
                if header_len < TCP_HEADER_LEN {
                    return;
                }
                if header_len > TCP_HEADER_LEN {
                    let options = header_len - TCP_HEADER_LEN;
                    if contiguous(frame, offset + TCP_HEADER_LEN, options, scratch, copies)
                        .is_none()
                    {
                        return;
                    }
                }
                self.tcp = Some(tcp);
                self.payload_offset = Some(offset + header_len);
            }
            _ => {}
        }
    }

    /// Decode the QUIC header at the transport payload
    pub(crate) fn parse_quic(
        &mut self,
        frame: &FrameBuffers<'_>,
        storage: &mut FrameStorage,
        copies: &mut u64,
    ) {
        self.quic_parsed = true;
        let Some(offset) = self.payload_offset else {
            return;
        };

        let inline = remaining_in_buffer(frame, offset);
        if let Some(quic) = QuicHeader::parse(inline) {
            self.quic = Some(quic);
            return;
        }

        if frame.buffer_count() > 1 {
            let read = frame.read_at(offset, &mut storage.quic);
            if read > inline.len() {
                *copies += 1;
            }
            self.quic = QuicHeader::parse(&storage.quic[..read]);
        }
    }
}
