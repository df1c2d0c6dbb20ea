use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use sluice_core::{ExtensionSet, ExtensionType};
use sluice_core::frame::{FRAME_FRAGMENT, FRAME_RX_ACTION, RX_FRAME_EXTENSIONS};
use sluice_core::ring::Ring;
use std::hint::black_box;

fn bench_ring_produce_consume(c: &mut Criterion) {
    let ring = Ring::allocate(16, 1024, 8).unwrap();

    let mut group = c.benchmark_group("ring");
    group.throughput(Throughput::Elements(32));

    group.bench_function("produce_consume_batch_32", |b| {
        b.iter(|| {
            let count = ring.reserve_producer(black_box(32));
            let start = ring.producer_index();
            for i in 0..count {
                unsafe { ring.write::<u64>(start.wrapping_add(i), u64::from(i)) };
            }
            ring.commit_producer(count);

            let ready = ring.peek_consumer(32);
            let start = ring.consumer_index();
            let mut sum = 0u64;
            for i in 0..ready {
                sum += unsafe { ring.read::<u64>(start.wrapping_add(i)) };
            }
            ring.release_consumer(ready);
            black_box(sum)
        })
    });

    ring.set_reserved_index(ring.producer_index());
    group.bench_function("mp_reserve_commit", |b| {
        b.iter(|| {
            if let Some((start, count)) = ring.reserve_producer_mp(black_box(8)) {
                ring.commit_producer_mp(start, count);
            }
            let ready = ring.peek_consumer(u32::MAX);
            ring.release_consumer(ready);
        })
    });

    group.finish();
}

fn bench_assign_layout(c: &mut Criterion) {
    c.bench_function("assign_layout_rx_frame", |b| {
        b.iter(|| {
            let mut set = ExtensionSet::new(ExtensionType::Frame, &RX_FRAME_EXTENSIONS).unwrap();
            set.register_version(&FRAME_FRAGMENT).unwrap();
            set.register_version(&FRAME_RX_ACTION).unwrap();
            set.enable(FRAME_FRAGMENT.name).unwrap();
            set.enable(FRAME_RX_ACTION.name).unwrap();
            black_box(set.assign_layout(black_box(24), 8).unwrap())
        })
    });
}

criterion_group!(benches, bench_ring_produce_consume, bench_assign_layout);
criterion_main!(benches);
