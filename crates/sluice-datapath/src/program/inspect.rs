//! First-match classification of one frame

use super::bytecode::{BytecodeContext, BytecodeProgram, verdict_action};
use super::headers::EthernetHeader;
use super::parse::{FrameCache, FrameStorage};
use super::rule::{QuicFlow, Rule, RuleAction, RuleMatch};
use crate::stats::RxQueueStats;
use sluice_core::{FrameBuffers, RxAction};

/// Outcome of classifying a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Deliver to the regular stack
    Pass,
    /// Discard
    Drop,
    /// Reflected by L2 forwarding
    Forward,
    /// Matched the redirect rule at this index
    Redirect(usize),
}

impl Verdict {
    pub(crate) fn rx_action(self) -> RxAction {
        match self {
            Verdict::Pass => RxAction::Pass,
            Verdict::Drop | Verdict::Redirect(_) => RxAction::Drop,
            Verdict::Forward => RxAction::Tx,
        }
    }

    pub(crate) fn record(self, stats: &RxQueueStats) {
        match self {
            Verdict::Pass => stats.record_passed(),
            Verdict::Drop => stats.record_dropped(),
            Verdict::Forward => stats.record_forwarded(),
            Verdict::Redirect(_) => stats.record_redirected(),
        }
    }
}

/// Per-queue classification state: header scratch space and copy counter
pub(crate) struct Inspector {
    storage: FrameStorage,
    header_copies: u64,
}

impl Inspector {
    pub(crate) fn new() -> Self {
        Self {
            storage: FrameStorage::new(),
            header_copies: 0,
        }
    }

    /// Scratch copies since the last call
    pub(crate) fn take_header_copies(&mut self) -> u64 {
        std::mem::take(&mut self.header_copies)
    }

    /// Walk `rules` in order and apply the first one that matches
    pub(crate) fn classify(&mut self, rules: &[Rule], frame: &mut FrameBuffers<'_>) -> Verdict {
        let mut cache = FrameCache::default();

        for (index, rule) in rules.iter().enumerate() {
            if !self.matches(&rule.matcher, &mut cache, frame) {
                continue;
            }
            return match rule.action {
                RuleAction::Redirect(_) => Verdict::Redirect(index),
                RuleAction::Pass => Verdict::Pass,
                // Byte-code programs are dispatched separately; reaching one
                // here means the rule table was mixed.
                RuleAction::Drop | RuleAction::Bytecode(_) => Verdict::Drop,
                RuleAction::L2Fwd => self.l2_forward(&mut cache, frame),
            };
        }

        Verdict::Pass
    }

    fn matches(
        &mut self,
        matcher: &RuleMatch,
        cache: &mut FrameCache,
        frame: &FrameBuffers<'_>,
    ) -> bool {
        if matches!(matcher, RuleMatch::All) {
            return true;
        }
        if !cache.parsed {
            cache.parse(frame, &mut self.storage, &mut self.header_copies);
        }

        match matcher {
            RuleMatch::All => true,
            RuleMatch::Udp => cache.udp.is_some(),
            RuleMatch::Tcp => cache.tcp.is_some(),
            RuleMatch::UdpDst(port) => cache.udp.is_some_and(|udp| udp.destination_port == *port),
            RuleMatch::TcpDst(port) => cache.tcp.is_some_and(|tcp| tcp.destination_port == *port),
            RuleMatch::TcpControlDst(port) => cache
                .tcp
                .is_some_and(|tcp| tcp.destination_port == *port && tcp.is_control()),
            RuleMatch::Ipv4DstMask { address, mask } => cache.ipv4.is_some_and(|ip| {
                u32::from(ip.destination) & u32::from(*mask) == u32::from(*address)
            }),
            RuleMatch::Ipv6DstMask { address, mask } => cache.ipv6.is_some_and(|ip| {
                u128::from(ip.destination) & u128::from(*mask) == u128::from(*address)
            }),
            RuleMatch::UdpPortSet(ports) => cache
                .udp
                .is_some_and(|udp| ports.contains(udp.destination_port)),
            RuleMatch::Ipv4UdpPortSet { address, ports } => {
                cache.ipv4.is_some_and(|ip| ip.destination == *address)
                    && cache
                        .udp
                        .is_some_and(|udp| ports.contains(udp.destination_port))
            }
            RuleMatch::Ipv6UdpPortSet { address, ports } => {
                cache.ipv6.is_some_and(|ip| ip.destination == *address)
                    && cache
                        .udp
                        .is_some_and(|udp| ports.contains(udp.destination_port))
            }
            RuleMatch::Ipv4TcpPortSet { address, ports } => {
                cache.ipv4.is_some_and(|ip| ip.destination == *address)
                    && cache
                        .tcp
                        .is_some_and(|tcp| ports.contains(tcp.destination_port))
            }
            RuleMatch::Ipv6TcpPortSet { address, ports } => {
                cache.ipv6.is_some_and(|ip| ip.destination == *address)
                    && cache
                        .tcp
                        .is_some_and(|tcp| ports.contains(tcp.destination_port))
            }
            RuleMatch::Ipv4UdpTuple(tuple) => match (cache.ipv4, cache.udp) {
                (Some(ip), Some(udp)) => {
                    udp.source_port == tuple.source_port
                        && udp.destination_port == tuple.destination_port
                        && ip.source == tuple.source_address
                        && ip.destination == tuple.destination_address
                }
                _ => false,
            },
            RuleMatch::Ipv6UdpTuple(tuple) => match (cache.ipv6, cache.udp) {
                (Some(ip), Some(udp)) => {
                    udp.source_port == tuple.source_port
                        && udp.destination_port == tuple.destination_port
                        && ip.source == tuple.source_address
                        && ip.destination == tuple.destination_address
                }
                _ => false,
            },
            RuleMatch::QuicFlowSrcCid(flow) => {
                let port = cache.udp.map(|udp| udp.destination_port);
                self.quic_matches(cache, frame, port, flow, true)
            }
            RuleMatch::QuicFlowDstCid(flow) => {
                let port = cache.udp.map(|udp| udp.destination_port);
                self.quic_matches(cache, frame, port, flow, false)
            }
            RuleMatch::TcpQuicFlowSrcCid(flow) => {
                let port = cache.tcp.map(|tcp| tcp.destination_port);
                self.quic_matches(cache, frame, port, flow, true)
            }
            RuleMatch::TcpQuicFlowDstCid(flow) => {
                let port = cache.tcp.map(|tcp| tcp.destination_port);
                self.quic_matches(cache, frame, port, flow, false)
            }
        }
    }

    fn quic_matches(
        &mut self,
        cache: &mut FrameCache,
        frame: &FrameBuffers<'_>,
        port: Option<u16>,
        flow: &QuicFlow,
        source_cid: bool,
    ) -> bool {
        if port != Some(flow.port) || cache.payload_offset.is_none() {
            return false;
        }
        if !cache.quic_parsed {
            cache.parse_quic(frame, &mut self.storage, &mut self.header_copies);
        }
        cache.quic.is_some_and(|quic| {
            quic.is_long_header == source_cid && quic.cid_matches(flow.cid_offset, flow.window())
        })
    }

    fn l2_forward(&mut self, cache: &mut FrameCache, frame: &mut FrameBuffers<'_>) -> Verdict {
        if !cache.parsed {
            cache.parse(frame, &mut self.storage, &mut self.header_copies);
        }
        let Some(eth) = cache.ethernet else {
            return Verdict::Drop;
        };

        frame.write_at(0, &eth.swapped_addresses());
        cache.ethernet = Some(EthernetHeader {
            destination: eth.source,
            source: eth.destination,
            ..eth
        });
        Verdict::Forward
    }
}

/// Run a byte-code program over the inline buffer of a frame
pub(crate) fn inspect_bytecode(
    program: &dyn BytecodeProgram,
    frame: &mut FrameBuffers<'_>,
    ingress_ifindex: u32,
    rx_queue_index: u32,
    stats: &RxQueueStats,
) -> RxAction {
    let mut context = BytecodeContext {
        data: frame.data_mut(0),
        ingress_ifindex,
        rx_queue_index,
    };
    let action = verdict_action(program.run(&mut context));
    match action {
        RxAction::Pass => stats.record_passed(),
        RxAction::Drop => stats.record_dropped(),
        RxAction::Tx => stats.record_forwarded(),
    }
    action
}
