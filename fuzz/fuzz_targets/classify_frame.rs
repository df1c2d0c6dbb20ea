#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sluice_core::RxAction;
use sluice_datapath::interface::HookId;
use sluice_datapath::program::{Ipv4Tuple, PortSet, QuicFlow};
use sluice_datapath::soft::{SoftInterface, SoftInterfaceConfig};
use sluice_datapath::{
    DatapathConfig, Privilege, Program, ProgramFlags, ProgramHandle, Rule, RuleAction, RuleMatch,
    State,
};
use std::sync::Arc;

const MAX_FRAGMENTS: u8 = 4;

#[derive(Debug, Arbitrary)]
struct Input {
    buffers: Vec<Vec<u8>>,
}

struct Datapath {
    soft: Arc<SoftInterface>,
    _program: ProgramHandle,
}

fn rules() -> Vec<Rule> {
    let cid = [0x5a; 8];
    let rule = |matcher, action| Rule::new(matcher, action);
    vec![
        rule(
            RuleMatch::QuicFlowSrcCid(QuicFlow::new(443, 0, &cid).unwrap()),
            RuleAction::Drop,
        ),
        rule(
            RuleMatch::QuicFlowDstCid(QuicFlow::new(443, 4, &cid).unwrap()),
            RuleAction::Drop,
        ),
        rule(
            RuleMatch::TcpQuicFlowSrcCid(QuicFlow::new(8443, 2, &cid).unwrap()),
            RuleAction::Drop,
        ),
        rule(RuleMatch::TcpControlDst(22), RuleAction::Pass),
        rule(
            RuleMatch::Ipv4UdpTuple(Ipv4Tuple {
                source_address: [10, 0, 0, 1].into(),
                destination_address: [10, 0, 0, 2].into(),
                source_port: 4000,
                destination_port: 53,
            }),
            RuleAction::L2Fwd,
        ),
        rule(
            RuleMatch::Ipv6DstMask {
                address: "fd00::".parse().unwrap(),
                mask: "ffff::".parse().unwrap(),
            },
            RuleAction::Drop,
        ),
        rule(
            RuleMatch::UdpPortSet(PortSet::from_ports([53, 123, 5353])),
            RuleAction::Drop,
        ),
        rule(RuleMatch::Tcp, RuleAction::Pass),
    ]
}

fn datapath() -> Datapath {
    let state = State::new(DatapathConfig::default()).unwrap();
    let soft = SoftInterface::new(SoftInterfaceConfig {
        max_fragments: MAX_FRAGMENTS,
        ..Default::default()
    });
    state.register_interface(soft.clone()).unwrap();
    let program = Program::create(
        &state,
        1,
        HookId::RX_INSPECT,
        0,
        ProgramFlags::empty(),
        rules(),
        Privilege::User,
    )
    .unwrap();
    Datapath {
        soft,
        _program: program,
    }
}

thread_local! {
    static DATAPATH: Datapath = datapath();
}

fuzz_target!(|input: Input| {
    if input.buffers.is_empty() || input.buffers.len() > usize::from(MAX_FRAGMENTS) + 1 {
        return;
    }
    let buffers: Vec<&[u8]> = input.buffers.iter().map(Vec::as_slice).collect();

    DATAPATH.with(|datapath| {
        let outcomes = datapath
            .soft
            .inject_fragmented(0, &[buffers.clone()])
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert_eq!(outcome.data.len(), buffers.iter().map(|b| b.len()).sum::<usize>());
        if outcome.action != RxAction::Tx {
            assert_eq!(outcome.data, buffers.concat());
        }

        // Same verdict with the frame in one buffer.
        let whole = buffers.concat();
        let contiguous = datapath.soft.inject(0, &[whole.as_slice()]).unwrap();
        assert_eq!(contiguous[0].action, outcome.action);
    });
});
