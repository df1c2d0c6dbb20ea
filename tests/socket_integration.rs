//! Socket TX/RX round trips through a software interface.

use sluice_core::{RingFlags, RxAction};
use sluice_datapath::interface::HookId;
use sluice_datapath::packet::PacketBuilder;
use sluice_datapath::soft::{SoftInterface, SoftInterfaceConfig};
use sluice_datapath::{
    DatapathConfig, DatapathError, Privilege, Program, ProgramFlags, ProgramHandle,
    REDIRECT_BATCH_CAPACITY, RedirectTarget, Rule, RuleAction, RuleMatch, State, Xsk,
    XskBufferDescriptor, XskError, XskNotifyFlags, XskRingKind,
};
use sluice_integration_tests::{CHUNK_SIZE, Fixture, rx_socket, tx_socket, udp_frame, v4};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const HEADROOM: u16 = 16;

fn payload(index: usize) -> Vec<u8> {
    format!("frame-{index}-{}", "x".repeat(index * 7)).into_bytes()
}

/// Write `count` payloads into consecutive chunks, post them on the TX ring
/// and poke the socket. Returns the payloads.
fn transmit(xsk: &Xsk, count: usize) -> Vec<Vec<u8>> {
    let umem = xsk.umem().unwrap();
    let tx = xsk.ring(XskRingKind::Tx).unwrap();
    let payloads: Vec<Vec<u8>> = (0..count).map(payload).collect();

    let descriptors: Vec<XskBufferDescriptor> = payloads
        .iter()
        .enumerate()
        .map(|(chunk, data)| {
            let base = chunk as u64 * u64::from(CHUNK_SIZE);
            umem.write(base + u64::from(HEADROOM), data).unwrap();
            XskBufferDescriptor::new(base, HEADROOM, data.len() as u32)
        })
        .collect();
    assert_eq!(tx.produce(&descriptors), count);

    let ready = xsk
        .notify(XskNotifyFlags::POKE_TX | XskNotifyFlags::WAIT_TX, Duration::from_secs(5))
        .unwrap();
    assert!(ready.tx_completion_available);
    payloads
}

fn completed(xsk: &Xsk) -> Vec<u64> {
    xsk.ring(XskRingKind::TxCompletion)
        .unwrap()
        .consume::<u64>(usize::MAX)
}

fn chunk_bases(count: usize) -> Vec<u64> {
    (0..count as u64).map(|chunk| chunk * u64::from(CHUNK_SIZE)).collect()
}

fn redirect_to(matcher: RuleMatch, xsk: &Arc<Xsk>) -> Rule {
    Rule::new(matcher, RuleAction::Redirect(RedirectTarget::Xsk(xsk.clone())))
}

fn attach(fixture: &Fixture, rules: Vec<Rule>) -> ProgramHandle {
    Program::create(
        &fixture.state,
        fixture.if_index(),
        HookId::RX_INSPECT,
        0,
        ProgramFlags::empty(),
        rules,
        Privilege::User,
    )
    .unwrap()
}

/// UDP frames to `ports`, each with a payload naming its position
fn numbered_frames(ports: &[u16]) -> Vec<Vec<u8>> {
    ports
        .iter()
        .enumerate()
        .map(|(index, port)| {
            PacketBuilder::udp_v4(v4(1, 40000), v4(2, *port))
                .payload(format!("frame-{index}").as_bytes())
                .build()
        })
        .collect()
}

/// Drain the RX ring and read back every delivered frame
fn received(xsk: &Xsk) -> Vec<Vec<u8>> {
    let umem = xsk.umem().unwrap();
    xsk.ring(XskRingKind::Rx)
        .unwrap()
        .consume::<XskBufferDescriptor>(usize::MAX)
        .iter()
        .map(|descriptor| {
            let start = descriptor.address.base() + u64::from(descriptor.address.offset());
            umem.read(start, descriptor.length as usize).unwrap()
        })
        .collect()
}

#[test]
fn test_tx_in_order_completion() {
    let fixture = Fixture::default();
    let xsk = tx_socket(&fixture, 8, 8);

    let payloads = transmit(&xsk, 4);
    assert_eq!(fixture.soft.transmitted(0), payloads);
    assert_eq!(completed(&xsk), chunk_bases(4));
    assert_eq!(xsk.outstanding_tx(), 0);
    assert_eq!(xsk.tx_bounce_references(0), Some(0));

    let queue = fixture
        .state
        .binding(fixture.if_index())
        .unwrap()
        .tx_queue(0)
        .unwrap();
    let stats = queue.statistics();
    assert_eq!(stats.frames_produced, 4);
    assert_eq!(stats.frames_completed, 4);
}

#[test]
fn test_tx_out_of_order_completion() {
    let fixture = Fixture::new(SoftInterfaceConfig {
        out_of_order_completion: true,
        ..Default::default()
    });
    let xsk = tx_socket(&fixture, 8, 8);

    let payloads = transmit(&xsk, 3);
    assert_eq!(fixture.soft.transmitted(0), payloads);
    assert_eq!(completed(&xsk), chunk_bases(3));
    assert_eq!(xsk.outstanding_tx(), 0);
}

#[test]
fn test_tx_mdl_addressing_without_bounce() {
    let state = State::new(DatapathConfig {
        disable_tx_bounce: true,
        ..Default::default()
    })
    .unwrap();
    let soft = SoftInterface::new(SoftInterfaceConfig {
        virtual_address_enabled: false,
        mdl_enabled: true,
        ..Default::default()
    });
    state.register_interface(soft.clone()).unwrap();
    let fixture = Fixture { state, soft };
    let xsk = tx_socket(&fixture, 8, 8);

    let payloads = transmit(&xsk, 2);
    assert_eq!(fixture.soft.transmitted(0), payloads);
    assert_eq!(completed(&xsk), chunk_bases(2));
    assert_eq!(xsk.tx_bounce_references(0), None);
}

#[test]
fn test_tx_completion_ring_bounds_pull() {
    let fixture = Fixture::default();
    let xsk = tx_socket(&fixture, 8, 4);
    let umem = xsk.umem().unwrap();
    let tx = xsk.ring(XskRingKind::Tx).unwrap();

    let descriptors: Vec<XskBufferDescriptor> = (0..4u64)
        .map(|chunk| {
            umem.write(chunk * u64::from(CHUNK_SIZE), b"ping").unwrap();
            XskBufferDescriptor::new(chunk * u64::from(CHUNK_SIZE), 0, 4)
        })
        .collect();
    assert_eq!(tx.produce(&descriptors), 4);
    xsk.notify(XskNotifyFlags::POKE_TX, Duration::ZERO).unwrap();
    assert_eq!(fixture.soft.transmitted(0).len(), 4);

    // Completion ring is full until the application drains it.
    assert_eq!(tx.produce(&descriptors), 4);
    xsk.notify(XskNotifyFlags::POKE_TX, Duration::ZERO).unwrap();
    assert!(fixture.soft.transmitted(0).is_empty());
    assert!(tx.needs_poke());

    assert_eq!(completed(&xsk).len(), 4);
    xsk.notify(XskNotifyFlags::POKE_TX, Duration::ZERO).unwrap();
    assert_eq!(fixture.soft.transmitted(0).len(), 4);
    assert_eq!(completed(&xsk).len(), 4);
}

#[test]
fn test_close_releases_tx_queue() {
    let fixture = Fixture::default();
    let xsk = tx_socket(&fixture, 8, 8);
    transmit(&xsk, 1);

    let binding = fixture.state.binding(fixture.if_index()).unwrap();
    assert!(binding.tx_queue(0).is_some());
    drop(xsk);
    assert!(binding.tx_queue(0).is_none());
}

#[test]
fn test_wait_rx_wakes_on_redirect() {
    let fixture = Fixture::default();
    let xsk = rx_socket(&fixture, 8, 8, 8);
    let _program = Program::create(
        &fixture.state,
        fixture.if_index(),
        HookId::RX_INSPECT,
        0,
        ProgramFlags::empty(),
        vec![Rule::new(
            RuleMatch::All,
            RuleAction::Redirect(RedirectTarget::Xsk(xsk.clone())),
        )],
        Privilege::User,
    )
    .unwrap();

    let waiter = {
        let xsk = Arc::clone(&xsk);
        thread::spawn(move || xsk.notify(XskNotifyFlags::WAIT_RX, Duration::from_secs(5)))
    };
    let frame = udp_frame(7000);
    let outcomes = fixture.soft.inject(0, &[&frame]).unwrap();
    assert_eq!(outcomes[0].action, RxAction::Drop);

    let ready = waiter.join().unwrap().unwrap();
    assert!(ready.rx_available);
    let delivered = xsk
        .ring(XskRingKind::Rx)
        .unwrap()
        .consume::<XskBufferDescriptor>(usize::MAX);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].length as usize, frame.len());
}

#[test]
fn test_wait_times_out_and_cancels() {
    let fixture = Fixture::default();
    let xsk = rx_socket(&fixture, 8, 8, 8);

    assert!(matches!(
        xsk.notify(XskNotifyFlags::WAIT_RX, Duration::from_millis(10)),
        Err(DatapathError::Timeout)
    ));

    let waiter = {
        let xsk = Arc::clone(&xsk);
        thread::spawn(move || xsk.notify(XskNotifyFlags::WAIT_RX, Duration::from_secs(30)))
    };
    // Cancellation only lands once the waiter is parked.
    while !waiter.is_finished() {
        xsk.cancel_notify();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(matches!(waiter.join().unwrap(), Err(DatapathError::Cancelled)));
}

#[test]
fn test_redirect_batches_split_on_target_change() {
    let fixture = Fixture::default();
    let a = rx_socket(&fixture, 8, 8, 8);
    let b = rx_socket(&fixture, 8, 8, 8);
    let _program = attach(
        &fixture,
        vec![
            redirect_to(RuleMatch::UdpDst(1000), &a),
            redirect_to(RuleMatch::UdpDst(2000), &b),
        ],
    );

    let frames = numbered_frames(&[1000, 2000, 1000, 1000, 2000]);
    let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
    let outcomes = fixture.soft.inject(0, &refs).unwrap();
    assert!(outcomes.iter().all(|outcome| outcome.action == RxAction::Drop));

    assert_eq!(
        received(&a),
        vec![frames[0].clone(), frames[2].clone(), frames[3].clone()]
    );
    assert_eq!(received(&b), vec![frames[1].clone(), frames[4].clone()]);

    let stats = fixture
        .state
        .binding(fixture.if_index())
        .unwrap()
        .rx_queue(0)
        .unwrap()
        .statistics();
    assert_eq!(stats.inspect_batches, 1);
    assert_eq!(stats.inspect_frames_redirected, 5);
    // a, b, a a, b
    assert_eq!(stats.redirect_batches, 4);
}

#[test]
fn test_redirect_batch_flushes_at_capacity() {
    let fixture = Fixture::new(SoftInterfaceConfig {
        receive_frame_count_hint: 64,
        ..Default::default()
    });
    let xsk = rx_socket(&fixture, 64, 64, 64);
    // The leading rule keeps the queue off the exclusive path.
    let _program = attach(
        &fixture,
        vec![
            Rule::new(RuleMatch::UdpDst(9), RuleAction::Pass),
            redirect_to(RuleMatch::All, &xsk),
        ],
    );

    let frames = numbered_frames(&[7000; REDIRECT_BATCH_CAPACITY + 8]);
    let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
    fixture.soft.inject(0, &refs).unwrap();

    assert_eq!(received(&xsk), frames);
    assert_eq!(xsk.statistics().rx_dropped, 0);

    let stats = fixture
        .state
        .binding(fixture.if_index())
        .unwrap()
        .rx_queue(0)
        .unwrap()
        .statistics();
    assert_eq!(stats.inspect_batches, 1);
    assert_eq!(stats.redirect_batches, 2);
}

#[test]
fn test_overrun_completion_cursor_marks_ring_invalid() {
    let fixture = Fixture::default();
    let xsk = tx_socket(&fixture, 8, 8);
    let completion = xsk.ring(XskRingKind::TxCompletion).unwrap();
    let producer = completion.ring().producer_index();
    completion.ring().set_consumer_index(producer.wrapping_add(1));

    xsk.umem().unwrap().write(0, b"ping").unwrap();
    let tx = xsk.ring(XskRingKind::Tx).unwrap();
    assert_eq!(tx.produce(&[XskBufferDescriptor::new(0, 0, 4)]), 1);
    xsk.notify(XskNotifyFlags::POKE_TX, Duration::from_millis(10))
        .unwrap();

    assert_eq!(completion.error(), XskError::InvalidRing);
    assert!(completion.ring().flags().contains(RingFlags::ERROR));
    assert!(fixture.soft.transmitted(0).is_empty());
    assert_eq!(xsk.outstanding_tx(), 0);
    assert_eq!(tx.error(), XskError::None);
}

#[test]
fn test_overrun_rx_cursor_marks_ring_invalid() {
    let fixture = Fixture::default();
    let xsk = rx_socket(&fixture, 8, 8, 8);
    let _program = attach(&fixture, vec![redirect_to(RuleMatch::All, &xsk)]);
    let rx = xsk.ring(XskRingKind::Rx).unwrap();
    rx.ring()
        .set_consumer_index(rx.ring().producer_index().wrapping_add(1));

    let outcomes = fixture.soft.inject(0, &[&udp_frame(7000)]).unwrap();
    assert_eq!(outcomes[0].action, RxAction::Drop);
    assert_eq!(rx.error(), XskError::InvalidRing);
    assert_eq!(xsk.statistics().rx_dropped, 1);

    // The error is permanent.
    rx.ring().set_consumer_index(rx.ring().producer_index());
    fixture.soft.inject(0, &[&udp_frame(7000)]).unwrap();
    assert_eq!(rx.error(), XskError::InvalidRing);
    assert_eq!(xsk.statistics().rx_dropped, 2);
}

#[test]
fn test_overrun_fill_cursor_marks_ring_invalid() {
    let fixture = Fixture::default();
    let xsk = rx_socket(&fixture, 8, 8, 8);
    let _program = attach(
        &fixture,
        vec![
            Rule::new(RuleMatch::UdpDst(9), RuleAction::Pass),
            redirect_to(RuleMatch::All, &xsk),
        ],
    );
    let fill = xsk.ring(XskRingKind::RxFill).unwrap();
    let capacity = fill.ring().capacity();
    fill.ring()
        .set_producer_index(fill.ring().consumer_index().wrapping_add(capacity + 1));

    let outcomes = fixture.soft.inject(0, &[&udp_frame(7000)]).unwrap();
    assert_eq!(outcomes[0].action, RxAction::Drop);
    assert_eq!(fill.error(), XskError::InvalidRing);
    assert_eq!(xsk.ring(XskRingKind::Rx).unwrap().error(), XskError::None);
    assert_eq!(xsk.statistics().rx_dropped, 1);
    assert!(received(&xsk).is_empty());
}
