//! Rule model: match predicates, patterns and actions

use super::bytecode::BytecodeProgram;
use super::headers::QUIC_MAX_CID_LENGTH;
use crate::error::{DatapathError, Result};
use crate::xsk::Xsk;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Size of a port set bitmap in bytes (one bit per port)
pub const PORT_SET_BUFFER_SIZE: usize = 65536 / 8;

/// Set of transport ports, stored as a bitmap indexed by the port in network
/// byte order
#[derive(Clone, PartialEq, Eq)]
pub struct PortSet {
    bits: Arc<[u8]>,
}

impl PortSet {
    /// Empty set
    pub fn new() -> Self {
        Self {
            bits: Arc::from(vec![0u8; PORT_SET_BUFFER_SIZE]),
        }
    }

    /// Set containing `ports`
    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let mut bits = vec![0u8; PORT_SET_BUFFER_SIZE];
        for port in ports {
            let index = Self::bit_index(port);
            bits[index >> 3] |= 1 << (index & 7);
        }
        Self {
            bits: Arc::from(bits),
        }
    }

    /// Copy a raw bitmap. It must be exactly [`PORT_SET_BUFFER_SIZE`] bytes.
    pub fn from_bitmap(bitmap: &[u8]) -> Result<Self> {
        if bitmap.len() != PORT_SET_BUFFER_SIZE {
            return Err(DatapathError::InvalidParameter(format!(
                "port set bitmap is {} bytes, expected {PORT_SET_BUFFER_SIZE}",
                bitmap.len()
            )));
        }
        Ok(Self {
            bits: Arc::from(bitmap),
        })
    }

    fn bit_index(port: u16) -> usize {
        usize::from(port.to_be())
    }

    /// Whether `port` (host order) is in the set
    pub fn contains(&self, port: u16) -> bool {
        let index = Self::bit_index(port);
        (self.bits[index >> 3] >> (index & 7)) & 1 != 0
    }

    /// Raw bitmap
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Number of ports in the set
    pub fn len(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|b| *b == 0)
    }
}

impl Default for PortSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PortSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSet").field("ports", &self.len()).finish()
    }
}

/// UDP 4-tuple over IPv4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Tuple {
    /// Source address
    pub source_address: Ipv4Addr,
    /// Destination address
    pub destination_address: Ipv4Addr,
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
}

/// UDP 4-tuple over IPv6
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6Tuple {
    /// Source address
    pub source_address: Ipv6Addr,
    /// Destination address
    pub destination_address: Ipv6Addr,
    /// Source port
    pub source_port: u16,
    /// Destination port
    pub destination_port: u16,
}

/// QUIC connection ID window to match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuicFlow {
    /// Transport destination port
    pub port: u16,
    /// Offset of the window inside the CID
    pub cid_offset: u8,
    /// Length of the window
    pub cid_length: u8,
    /// Window contents; bytes past `cid_length` are ignored
    pub cid_data: [u8; QUIC_MAX_CID_LENGTH],
}

impl QuicFlow {
    /// Match `cid` at `cid_offset` of connections on `port`
    pub fn new(port: u16, cid_offset: u8, cid: &[u8]) -> Result<Self> {
        let cid_length = u8::try_from(cid.len()).map_err(|_| {
            DatapathError::InvalidParameter("QUIC CID window too long".into())
        })?;
        let mut cid_data = [0u8; QUIC_MAX_CID_LENGTH];
        let flow_end = usize::from(cid_offset) + cid.len();
        if flow_end > QUIC_MAX_CID_LENGTH {
            return Err(DatapathError::InvalidParameter(format!(
                "QUIC CID window ends at {flow_end}, past {QUIC_MAX_CID_LENGTH}"
            )));
        }
        cid_data[..cid.len()].copy_from_slice(cid);
        Ok(Self {
            port,
            cid_offset,
            cid_length,
            cid_data,
        })
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let end = usize::from(self.cid_offset) + usize::from(self.cid_length);
        if end > QUIC_MAX_CID_LENGTH {
            return Err(format!(
                "QUIC CID window ends at {end}, past {QUIC_MAX_CID_LENGTH}"
            ));
        }
        Ok(())
    }

    /// The significant window bytes
    pub fn window(&self) -> &[u8] {
        &self.cid_data[..usize::from(self.cid_length)]
    }
}

/// Match predicate of a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    /// Every frame
    All,
    /// Any valid UDP header
    Udp,
    /// Any valid TCP header
    Tcp,
    /// UDP destination port
    UdpDst(u16),
    /// TCP destination port
    TcpDst(u16),
    /// TCP destination port with SYN, FIN or RST set
    TcpControlDst(u16),
    /// IPv4 destination prefix
    Ipv4DstMask {
        /// Prefix, compared against `destination & mask`
        address: Ipv4Addr,
        /// Mask
        mask: Ipv4Addr,
    },
    /// IPv6 destination prefix
    Ipv6DstMask {
        /// Prefix, compared against `destination & mask`
        address: Ipv6Addr,
        /// Mask
        mask: Ipv6Addr,
    },
    /// UDP destination port in set
    UdpPortSet(PortSet),
    /// IPv4 destination address and UDP destination port in set
    Ipv4UdpPortSet {
        /// Destination address
        address: Ipv4Addr,
        /// Ports
        ports: PortSet,
    },
    /// IPv6 destination address and UDP destination port in set
    Ipv6UdpPortSet {
        /// Destination address
        address: Ipv6Addr,
        /// Ports
        ports: PortSet,
    },
    /// IPv4 destination address and TCP destination port in set
    Ipv4TcpPortSet {
        /// Destination address
        address: Ipv4Addr,
        /// Ports
        ports: PortSet,
    },
    /// IPv6 destination address and TCP destination port in set
    Ipv6TcpPortSet {
        /// Destination address
        address: Ipv6Addr,
        /// Ports
        ports: PortSet,
    },
    /// Exact UDP/IPv4 4-tuple
    Ipv4UdpTuple(Ipv4Tuple),
    /// Exact UDP/IPv6 4-tuple
    Ipv6UdpTuple(Ipv6Tuple),
    /// QUIC long header source CID over UDP
    QuicFlowSrcCid(QuicFlow),
    /// QUIC short header destination CID over UDP
    QuicFlowDstCid(QuicFlow),
    /// QUIC long header source CID over TCP
    TcpQuicFlowSrcCid(QuicFlow),
    /// QUIC short header destination CID over TCP
    TcpQuicFlowDstCid(QuicFlow),
}

impl RuleMatch {
    fn quic_flow(&self) -> Option<&QuicFlow> {
        match self {
            RuleMatch::QuicFlowSrcCid(flow)
            | RuleMatch::QuicFlowDstCid(flow)
            | RuleMatch::TcpQuicFlowSrcCid(flow)
            | RuleMatch::TcpQuicFlowDstCid(flow) => Some(flow),
            _ => None,
        }
    }
}

/// Consumer of redirected frames
#[derive(Clone)]
pub enum RedirectTarget {
    /// Deliver into a socket's RX ring
    Xsk(Arc<Xsk>),
}

impl std::fmt::Debug for RedirectTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedirectTarget::Xsk(xsk) => f.debug_tuple("Xsk").field(&xsk.id()).finish(),
        }
    }
}

impl RedirectTarget {
    pub(crate) fn same_target(&self, other: &RedirectTarget) -> bool {
        match (self, other) {
            (RedirectTarget::Xsk(a), RedirectTarget::Xsk(b)) => Arc::ptr_eq(a, b),
        }
    }
}

/// What to do with a matching frame
#[derive(Clone)]
pub enum RuleAction {
    /// Discard
    Drop,
    /// Deliver to the regular stack
    Pass,
    /// Swap Ethernet addresses and transmit back out
    L2Fwd,
    /// Hand to another consumer
    Redirect(RedirectTarget),
    /// Run a byte-code program
    Bytecode(Arc<dyn BytecodeProgram>),
}

impl std::fmt::Debug for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Drop => f.write_str("Drop"),
            RuleAction::Pass => f.write_str("Pass"),
            RuleAction::L2Fwd => f.write_str("L2Fwd"),
            RuleAction::Redirect(target) => f.debug_tuple("Redirect").field(target).finish(),
            RuleAction::Bytecode(_) => f.write_str("Bytecode"),
        }
    }
}

/// One match-predicate and action pair
#[derive(Debug, Clone)]
pub struct Rule {
    /// Predicate
    pub matcher: RuleMatch,
    /// Action applied on match
    pub action: RuleAction,
}

impl Rule {
    /// Build a rule
    pub fn new(matcher: RuleMatch, action: RuleAction) -> Self {
        Self { matcher, action }
    }
}

/// Privilege of the caller creating a program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Regular caller
    User,
    /// Administrator; may load byte-code
    Admin,
}

/// Validate caller-supplied rules and take ownership of them
///
/// Any failure discards everything captured so far, dropping the socket
/// references taken along the way.
pub fn capture(rules: Vec<Rule>, privilege: Privilege) -> Result<Arc<[Rule]>> {
    if rules.is_empty() {
        return Err(DatapathError::InvalidParameter(
            "program needs at least one rule".into(),
        ));
    }

    let rule_count = rules.len();
    let mut captured = Vec::with_capacity(rule_count);

    for (index, rule) in rules.into_iter().enumerate() {
        if let Some(flow) = rule.matcher.quic_flow() {
            flow.validate()
                .map_err(|reason| DatapathError::InvalidRule { index, reason })?;
        }

        if let RuleAction::Bytecode(_) = rule.action {
            if rule_count != 1 || rule.matcher != RuleMatch::All {
                return Err(DatapathError::InvalidRule {
                    index,
                    reason: "byte-code must be the only rule and match all frames".into(),
                });
            }
            if privilege != Privilege::Admin {
                return Err(DatapathError::AccessDenied(
                    "byte-code programs require administrator privilege".into(),
                ));
            }
        }

        captured.push(rule);
    }

    Ok(Arc::from(captured))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::bytecode::{BytecodeContext, BytecodeFault, VERDICT_PASS};

    fn pass_program() -> Arc<dyn BytecodeProgram> {
        Arc::new(|_: &mut BytecodeContext<'_>| -> std::result::Result<u32, BytecodeFault> {
            Ok(VERDICT_PASS)
        })
    }

    #[test]
    fn test_port_set_membership() {
        let set = PortSet::from_ports([53, 443, 65535]);
        assert!(set.contains(53));
        assert!(set.contains(443));
        assert!(set.contains(65535));
        assert!(!set.contains(80));
        assert_eq!(set.len(), 3);
        assert!(!set.is_empty());

        let copy = PortSet::from_bitmap(set.as_bytes()).unwrap();
        assert_eq!(copy, set);
        assert!(PortSet::from_bitmap(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_port_set_indexed_by_network_order() {
        let set = PortSet::from_ports([0x0102]);
        let index = usize::from(0x0102u16.to_be());
        assert_eq!(set.as_bytes()[index >> 3], 1 << (index & 7));
    }

    #[test]
    fn test_quic_flow_window() {
        let flow = QuicFlow::new(443, 4, &[1, 2, 3]).unwrap();
        assert_eq!(flow.window(), &[1, 2, 3]);
        assert!(QuicFlow::new(443, 18, &[1, 2, 3]).is_err());
        assert!(QuicFlow::new(443, 0, &[0u8; 21]).is_err());
    }

    #[test]
    fn test_capture_rejects_bad_quic_window() {
        let mut flow = QuicFlow::new(443, 0, &[1]).unwrap();
        flow.cid_offset = 15;
        flow.cid_length = 8;
        let rules = vec![
            Rule::new(RuleMatch::Udp, RuleAction::Pass),
            Rule::new(RuleMatch::QuicFlowDstCid(flow), RuleAction::Drop),
        ];
        match capture(rules, Privilege::User) {
            Err(DatapathError::InvalidRule { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_capture_bytecode_constraints() {
        let single = vec![Rule::new(RuleMatch::All, RuleAction::Bytecode(pass_program()))];
        assert!(capture(single.clone(), Privilege::Admin).is_ok());
        assert!(matches!(
            capture(single, Privilege::User),
            Err(DatapathError::AccessDenied(_))
        ));

        let filtered = vec![Rule::new(RuleMatch::Udp, RuleAction::Bytecode(pass_program()))];
        assert!(capture(filtered, Privilege::Admin).is_err());

        let shared = vec![
            Rule::new(RuleMatch::All, RuleAction::Bytecode(pass_program())),
            Rule::new(RuleMatch::All, RuleAction::Pass),
        ];
        assert!(capture(shared, Privilege::Admin).is_err());
    }

    #[test]
    fn test_capture_rejects_empty() {
        assert!(capture(Vec::new(), Privilege::Admin).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_port_set_holds_exactly_its_ports(
                ports in proptest::collection::btree_set(any::<u16>(), 0..32),
                probe in any::<u16>(),
            ) {
                let set = PortSet::from_ports(ports.iter().copied());
                prop_assert_eq!(set.len(), ports.len());
                prop_assert_eq!(set.contains(probe), ports.contains(&probe));
                for port in &ports {
                    prop_assert!(set.contains(*port));
                }
            }
        }
    }
}
