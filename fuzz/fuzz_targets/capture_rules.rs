#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sluice_datapath::program::headers::QUIC_MAX_CID_LENGTH;
use sluice_datapath::program::{
    BytecodeContext, BytecodeFault, PortSet, QuicFlow, VERDICT_PASS, capture,
};
use sluice_datapath::{DatapathError, Privilege, Rule, RuleAction, RuleMatch};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

#[derive(Debug, Arbitrary)]
enum FuzzMatch {
    All,
    Udp,
    Tcp,
    UdpDst(u16),
    TcpControlDst(u16),
    Ipv4DstMask([u8; 4], [u8; 4]),
    Ipv6DstMask([u8; 16], [u8; 16]),
    UdpPortSet(Vec<u16>),
    QuicSrc {
        port: u16,
        cid_offset: u8,
        cid_length: u8,
        tcp: bool,
    },
    QuicDst {
        port: u16,
        cid_offset: u8,
        cid_length: u8,
        tcp: bool,
    },
}

#[derive(Debug, Arbitrary)]
enum FuzzAction {
    Drop,
    Pass,
    L2Fwd,
    Bytecode,
}

#[derive(Debug, Arbitrary)]
struct Input {
    rules: Vec<(FuzzMatch, FuzzAction)>,
    admin: bool,
}

fn flow(port: u16, cid_offset: u8, cid_length: u8) -> QuicFlow {
    QuicFlow {
        port,
        cid_offset,
        cid_length,
        cid_data: [0xab; QUIC_MAX_CID_LENGTH],
    }
}

fn build(matcher: FuzzMatch, action: FuzzAction) -> Rule {
    let matcher = match matcher {
        FuzzMatch::All => RuleMatch::All,
        FuzzMatch::Udp => RuleMatch::Udp,
        FuzzMatch::Tcp => RuleMatch::Tcp,
        FuzzMatch::UdpDst(port) => RuleMatch::UdpDst(port),
        FuzzMatch::TcpControlDst(port) => RuleMatch::TcpControlDst(port),
        FuzzMatch::Ipv4DstMask(address, mask) => RuleMatch::Ipv4DstMask {
            address: Ipv4Addr::from(address),
            mask: Ipv4Addr::from(mask),
        },
        FuzzMatch::Ipv6DstMask(address, mask) => RuleMatch::Ipv6DstMask {
            address: Ipv6Addr::from(address),
            mask: Ipv6Addr::from(mask),
        },
        FuzzMatch::UdpPortSet(ports) => RuleMatch::UdpPortSet(PortSet::from_ports(ports)),
        FuzzMatch::QuicSrc {
            port,
            cid_offset,
            cid_length,
            tcp,
        } => {
            let flow = flow(port, cid_offset, cid_length);
            if tcp {
                RuleMatch::TcpQuicFlowSrcCid(flow)
            } else {
                RuleMatch::QuicFlowSrcCid(flow)
            }
        }
        FuzzMatch::QuicDst {
            port,
            cid_offset,
            cid_length,
            tcp,
        } => {
            let flow = flow(port, cid_offset, cid_length);
            if tcp {
                RuleMatch::TcpQuicFlowDstCid(flow)
            } else {
                RuleMatch::QuicFlowDstCid(flow)
            }
        }
    };
    let action = match action {
        FuzzAction::Drop => RuleAction::Drop,
        FuzzAction::Pass => RuleAction::Pass,
        FuzzAction::L2Fwd => RuleAction::L2Fwd,
        FuzzAction::Bytecode => RuleAction::Bytecode(Arc::new(
            |_: &mut BytecodeContext<'_>| -> Result<u32, BytecodeFault> { Ok(VERDICT_PASS) },
        )),
    };
    Rule::new(matcher, action)
}

fn window_fits(matcher: &RuleMatch) -> bool {
    match matcher {
        RuleMatch::QuicFlowSrcCid(flow)
        | RuleMatch::QuicFlowDstCid(flow)
        | RuleMatch::TcpQuicFlowSrcCid(flow)
        | RuleMatch::TcpQuicFlowDstCid(flow) => {
            usize::from(flow.cid_offset) + usize::from(flow.cid_length) <= QUIC_MAX_CID_LENGTH
        }
        _ => true,
    }
}

fuzz_target!(|input: Input| {
    let rules: Vec<Rule> = input
        .rules
        .into_iter()
        .take(64)
        .map(|(matcher, action)| build(matcher, action))
        .collect();
    let count = rules.len();
    let windows_fit = rules.iter().all(|rule| window_fits(&rule.matcher));
    let bytecode_ok = rules.iter().all(|rule| match rule.action {
        RuleAction::Bytecode(_) => count == 1 && rule.matcher == RuleMatch::All && input.admin,
        _ => true,
    });
    let privilege = if input.admin {
        Privilege::Admin
    } else {
        Privilege::User
    };

    match capture(rules, privilege) {
        Ok(captured) => {
            assert_eq!(captured.len(), count);
            assert!(windows_fit && bytecode_ok);
        }
        Err(DatapathError::InvalidParameter(_)) => assert_eq!(count, 0),
        Err(DatapathError::InvalidRule { index, .. }) => assert!(index < count),
        Err(DatapathError::AccessDenied(_)) => assert!(!input.admin),
        Err(e) => panic!("unexpected capture error: {e}"),
    }
});
