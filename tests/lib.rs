//! Shared fixtures for the SLUICE integration tests.

use sluice_datapath::packet::PacketBuilder;
use sluice_datapath::soft::{SoftInterface, SoftInterfaceConfig};
use sluice_datapath::{
    DatapathConfig, State, UmemReg, Xsk, XskBindFlags, XskRingKind,
};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

/// UMEM chunk size used by every test socket
pub const CHUNK_SIZE: u32 = 2048;

/// A datapath with one software interface registered on it
pub struct Fixture {
    /// Datapath state
    pub state: Arc<State>,
    /// The registered interface
    pub soft: Arc<SoftInterface>,
}

impl Fixture {
    /// Register a software interface built from `config`
    pub fn new(config: SoftInterfaceConfig) -> Self {
        let state = State::new(DatapathConfig::default()).unwrap();
        let soft = SoftInterface::new(config);
        state.register_interface(soft.clone()).unwrap();
        Self { state, soft }
    }

    /// Interface index of the registered interface
    pub fn if_index(&self) -> u32 {
        self.soft.config().if_index
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new(SoftInterfaceConfig::default())
    }
}

/// 10.0.0.`host`:`port`
pub fn v4(host: u8, port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, host), port)
}

/// UDP/IPv4 frame to `port` with a short payload
pub fn udp_frame(port: u16) -> Vec<u8> {
    PacketBuilder::udp_v4(v4(1, 40000), v4(2, port))
        .payload(b"sluice")
        .build()
}

/// Decode a hex fixture, ignoring whitespace
pub fn from_hex(fixture: &str) -> Vec<u8> {
    let compact: String = fixture.split_whitespace().collect();
    hex::decode(compact).unwrap()
}

/// Socket bound for RX on queue 0 with `fill_entries` chunks posted to a
/// fill ring of `fill_size`
pub fn rx_socket(fixture: &Fixture, rx_size: u32, fill_size: u32, fill_entries: u32) -> Arc<Xsk> {
    let xsk = Xsk::create(&fixture.state);
    let chunks = rx_size.max(fill_size).max(fill_entries);
    xsk.set_umem(UmemReg::new(u64::from(chunks) * u64::from(CHUNK_SIZE), CHUNK_SIZE, 0))
        .unwrap();
    xsk.set_ring_size(XskRingKind::Rx, rx_size).unwrap();
    xsk.set_ring_size(XskRingKind::RxFill, fill_size).unwrap();
    xsk.bind(fixture.if_index(), 0, XskBindFlags::RX).unwrap();
    xsk.activate().unwrap();

    let addresses: Vec<u64> = (0..u64::from(fill_entries))
        .map(|chunk| chunk * u64::from(CHUNK_SIZE))
        .collect();
    let fill = xsk.ring(XskRingKind::RxFill).unwrap();
    assert_eq!(fill.produce(&addresses), addresses.len());
    xsk
}

/// Socket bound for TX on queue 0 with `chunks` UMEM chunks and TX and
/// completion rings of `ring_size`
pub fn tx_socket(fixture: &Fixture, chunks: u32, ring_size: u32) -> Arc<Xsk> {
    let xsk = Xsk::create(&fixture.state);
    xsk.set_umem(UmemReg::new(u64::from(chunks) * u64::from(CHUNK_SIZE), CHUNK_SIZE, 0))
        .unwrap();
    xsk.set_ring_size(XskRingKind::Tx, ring_size).unwrap();
    xsk.set_ring_size(XskRingKind::TxCompletion, ring_size).unwrap();
    xsk.bind(fixture.if_index(), 0, XskBindFlags::TX).unwrap();
    xsk.activate().unwrap();
    xsk
}
