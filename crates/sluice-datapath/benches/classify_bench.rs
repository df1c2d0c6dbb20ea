use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use sluice_datapath::interface::HookId;
use sluice_datapath::packet::PacketBuilder;
use sluice_datapath::program::PortSet;
use sluice_datapath::soft::{SoftInterface, SoftInterfaceConfig};
use sluice_datapath::{
    DatapathConfig, Privilege, Program, ProgramFlags, Rule, RuleAction, RuleMatch, State,
};
use std::hint::black_box;
use std::net::SocketAddrV4;

fn rules(count: u16) -> Vec<Rule> {
    let mut rules: Vec<Rule> = (0..count)
        .map(|i| Rule::new(RuleMatch::UdpDst(10_000 + i), RuleAction::Drop))
        .collect();
    rules.push(Rule::new(
        RuleMatch::UdpPortSet(PortSet::from_ports([53, 443, 8443])),
        RuleAction::Pass,
    ));
    rules
}

fn bench_classify(c: &mut Criterion) {
    let frame = PacketBuilder::udp_v4(
        SocketAddrV4::new([10, 0, 0, 1].into(), 40000),
        SocketAddrV4::new([10, 0, 0, 2].into(), 443),
    )
    .payload(&[0u8; 64])
    .build();
    let batch: Vec<&[u8]> = (0..32).map(|_| frame.as_slice()).collect();

    let mut group = c.benchmark_group("classify");
    group.throughput(Throughput::Elements(batch.len() as u64));

    for count in [1u16, 16, 64] {
        let state = State::new(DatapathConfig::default()).unwrap();
        let soft = SoftInterface::new(SoftInterfaceConfig::default());
        state.register_interface(soft.clone()).unwrap();
        let _program = Program::create(
            &state,
            1,
            HookId::RX_INSPECT,
            0,
            ProgramFlags::empty(),
            rules(count),
            Privilege::User,
        )
        .unwrap();

        group.bench_with_input(BenchmarkId::new("udp_batch_32", count), &batch, |b, batch| {
            b.iter(|| black_box(soft.inject(0, black_box(batch)).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classify);
criterion_main!(benches);
