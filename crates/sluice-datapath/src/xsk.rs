//! Zero-copy sockets (XSK)
//!
//! A socket exposes four rings over a payload area (UMEM) registered by the
//! application:
//!
//! ```text
//!  application                                 datapath
//!  ───────────                                 ────────
//!   free chunks ──► [ RX-Fill ] ──► fill path: copy frame into chunk
//!   read frames ◄── [   RX    ] ◄──            write descriptor
//!
//!   send frames ──► [   TX    ] ──► drain path: TX queue frame ring
//!   reuse chunks ◄─ [ TX-Comp ] ◄── completion path
//! ```
//!
//! RX and TX elements are [`XskBufferDescriptor`]s; fill and completion
//! elements are `u64` UMEM offsets. Every ring carries a flags word: the
//! datapath raises [`RingFlags::NEED_POKE`] on TX when it stopped pulling and
//! [`RingFlags::ERROR`] when the application broke the ring protocol.
//!
//! ## Lifecycle
//!
//! `Unbound → Binding → Bound → Activating → Active → Detached | Closing`.
//! [`Xsk::set_umem`] and [`Xsk::set_ring_size`] configure the socket,
//! [`Xsk::bind`] picks an interface queue and [`Xsk::activate`] starts the
//! datapath. Dropping the last reference closes it.
//!
//! ## Bounce buffer
//!
//! Generic-mode interfaces may read a TX payload after the application
//! reused the chunk, so TX frames are staged through an immutable copy of the
//! UMEM. The copy happens when a chunk goes from zero to one frames in
//! flight and each completion drops one reference.

use crate::config::DatapathConfig;
use crate::error::{DatapathError, Result};
use crate::interface::{HookId, InterfaceMode};
use crate::rx::{RxQueue, RxQueueNotification, RxQueueObserver, RxRings};
use crate::state::{InterfaceBinding, State, next_object_id};
use crate::stats::{XskStatistics, XskStats};
use crate::tx::{TxQueue, TxRings};
use bitflags::bitflags;
use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use sluice_core::frame::{
    Buffer, BufferLogicalAddress, BufferMdl, BufferVirtualAddress, TxCompletionContext,
    TxFrameCompletion,
};
use sluice_core::header::size_of_u16;
use sluice_core::{
    FrameBuffers, ObjectHeader, Ring, RingFlags, RingInfo, RxAction, Versioned,
};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// How long closing a socket waits for in-flight TX frames to complete
pub const TX_RUNDOWN_TIMEOUT: Duration = Duration::from_secs(5);

const UMEM_ALIGNMENT: usize = 64;
const ADDRESS_BASE_MASK: u64 = (1 << 48) - 1;

bitflags! {
    /// Queues and mode requested by [`Xsk::bind`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XskBindFlags: u32 {
        /// Receive from the interface RX queue
        const RX = 0x1;
        /// Transmit through the interface TX queue
        const TX = 0x2;
        /// Require a generic-mode interface
        const GENERIC = 0x4;
        /// Require a native-mode interface
        const NATIVE = 0x8;
    }
}

bitflags! {
    /// Requests accepted by [`Xsk::notify`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct XskNotifyFlags: u32 {
        /// Ask the TX queue to pull from the TX ring
        const POKE_TX = 0x1;
        /// Wait until the RX ring has frames
        const WAIT_RX = 0x2;
        /// Wait until the completion ring has entries
        const WAIT_TX = 0x4;
    }
}

/// Readiness reported by [`Xsk::notify`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotifyResult {
    /// The RX ring has frames
    pub rx_available: bool,
    /// The completion ring has entries
    pub tx_completion_available: bool,
}

impl NotifyResult {
    fn any(&self) -> bool {
        self.rx_available || self.tx_completion_available
    }
}

/// Socket lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XskState {
    /// Created, not bound
    Unbound,
    /// Bind in progress
    Binding,
    /// Bound to interface queues
    Bound,
    /// Activation in progress
    Activating,
    /// Moving frames
    Active,
    /// The interface went away
    Detached,
    /// Closed by the application
    Closing,
}

/// One of the four socket rings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XskRingKind {
    /// Received frames
    Rx,
    /// Free chunks for reception
    RxFill,
    /// Frames to transmit
    Tx,
    /// Chunks of transmitted frames
    TxCompletion,
}

impl XskRingKind {
    const ALL: [XskRingKind; 4] = [
        XskRingKind::Rx,
        XskRingKind::RxFill,
        XskRingKind::Tx,
        XskRingKind::TxCompletion,
    ];

    fn index(self) -> usize {
        match self {
            XskRingKind::Rx => 0,
            XskRingKind::RxFill => 1,
            XskRingKind::Tx => 2,
            XskRingKind::TxCompletion => 3,
        }
    }

    /// Short name for logs and errors
    pub fn name(self) -> &'static str {
        match self {
            XskRingKind::Rx => "rx",
            XskRingKind::RxFill => "rx_fill",
            XskRingKind::Tx => "tx",
            XskRingKind::TxCompletion => "tx_completion",
        }
    }

    fn element_size(self) -> u32 {
        match self {
            XskRingKind::Rx | XskRingKind::Tx => size_of::<XskBufferDescriptor>() as u32,
            XskRingKind::RxFill | XskRingKind::TxCompletion => size_of::<u64>() as u32,
        }
    }
}

/// Error state of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum XskError {
    /// The ring is healthy
    None = 0,
    /// The application corrupted the ring's cursors
    InvalidRing = 1,
}

impl XskError {
    fn from_u32(value: u32) -> Self {
        match value {
            0 => XskError::None,
            _ => XskError::InvalidRing,
        }
    }
}

/// UMEM offset packed with a data offset: low 48 bits base, high 16 bits
/// offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct XskBufferAddress(u64);

impl XskBufferAddress {
    /// Pack `base` (truncated to 48 bits) and `offset`
    pub const fn new(base: u64, offset: u16) -> Self {
        Self((base & ADDRESS_BASE_MASK) | ((offset as u64) << 48))
    }

    /// Chunk address within the UMEM
    pub const fn base(self) -> u64 {
        self.0 & ADDRESS_BASE_MASK
    }

    /// Data offset from `base`
    pub const fn offset(self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// Packed form
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Element of the RX and TX rings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XskBufferDescriptor {
    /// Where the frame lives
    pub address: XskBufferAddress,
    /// Frame length
    pub length: u32,
    /// Reserved, zero
    pub reserved: u32,
}

impl XskBufferDescriptor {
    /// Descriptor of `length` bytes at `base + offset`
    pub fn new(base: u64, offset: u16, length: u32) -> Self {
        Self {
            address: XskBufferAddress::new(base, offset),
            length,
            reserved: 0,
        }
    }
}

/// UMEM registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UmemReg {
    /// Structure header
    pub header: ObjectHeader,
    /// Size of the payload area
    pub total_size: u64,
    /// Size of one chunk
    pub chunk_size: u32,
    /// Bytes left free at the start of each received chunk
    pub headroom: u32,
}

impl UmemReg {
    /// Registration of the current revision
    pub fn new(total_size: u64, chunk_size: u32, headroom: u32) -> Self {
        Self {
            header: Self::current_header(),
            total_size,
            chunk_size,
            headroom,
        }
    }

    /// Check bounds and drop a trailing partial chunk
    fn normalized(&self) -> Result<Self> {
        self.validate_header()?;
        if self.total_size == 0 || self.total_size > u32::MAX as u64 {
            return Err(DatapathError::InvalidParameter(format!(
                "UMEM size {} out of range",
                self.total_size
            )));
        }
        if self.chunk_size == 0 || self.chunk_size as u64 > self.total_size {
            return Err(DatapathError::InvalidParameter(format!(
                "UMEM chunk size {} out of range",
                self.chunk_size
            )));
        }
        if self.headroom > u16::MAX as u32 || self.headroom > self.chunk_size {
            return Err(DatapathError::InvalidParameter(format!(
                "UMEM headroom {} exceeds chunk size or 16 bits",
                self.headroom
            )));
        }

        let total_size = self.total_size - self.total_size % self.chunk_size as u64;
        Ok(Self { total_size, ..*self })
    }
}

impl Versioned for UmemReg {
    const REVISION: u8 = 1;
    const REVISION_SIZE: u16 = size_of_u16::<UmemReg>();

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// Zeroed heap region with a stable address
struct Region {
    base: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain bytes; concurrent access is governed by the
// ring protocol that hands chunks between the application and the datapath.
unsafe impl Send for Region {}
// SAFETY: see above.
unsafe impl Sync for Region {}

impl Region {
    fn zeroed(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, UMEM_ALIGNMENT)
            .map_err(|e| DatapathError::InvalidParameter(e.to_string()))?;
        // SAFETY: size is non-zero (UMEM registration rejects zero).
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw)
            .ok_or_else(|| DatapathError::Exhausted(format!("region of {size} bytes")))?;
        Ok(Self { base, layout })
    }

    fn len(&self) -> usize {
        self.layout.size()
    }

    fn mapping(&self) -> Mapping {
        Mapping {
            base: self.base,
            address: self.base.as_ptr() as usize as u64,
        }
    }

    /// Copy `len` bytes at `offset` into the same offset of `dst`
    fn copy_to(&self, dst: &Region, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len() && offset + len <= dst.len());
        // SAFETY: both regions are at least offset + len long (checked by the
        // caller against the UMEM size) and never overlap.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.base.as_ptr().add(offset),
                dst.base.as_ptr().add(offset),
                len,
            )
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in zeroed() with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// Address space a TX buffer was published from
#[derive(Clone, Copy)]
struct Mapping {
    base: NonNull<u8>,
    // Identity mapping: logical addresses and region handles are the host
    // address of the region.
    address: u64,
}

/// Registered payload area
pub struct Umem {
    reg: UmemReg,
    region: Region,
}

impl Umem {
    fn new(reg: UmemReg) -> Result<Self> {
        let reg = reg.normalized()?;
        let region = Region::zeroed(reg.total_size as usize)?;
        Ok(Self { reg, region })
    }

    /// Usable size, a whole number of chunks
    pub fn total_size(&self) -> u64 {
        self.reg.total_size
    }

    /// Chunk size
    pub fn chunk_size(&self) -> u32 {
        self.reg.chunk_size
    }

    /// Receive headroom
    pub fn headroom(&self) -> u32 {
        self.reg.headroom
    }

    /// Number of chunks
    pub fn chunk_count(&self) -> u64 {
        self.reg.total_size / self.reg.chunk_size as u64
    }

    fn range(&self, offset: u64, len: usize) -> Result<usize> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| DatapathError::InvalidParameter("UMEM range overflows".into()))?;
        if end > self.reg.total_size {
            return Err(DatapathError::InvalidParameter(format!(
                "UMEM range {offset}..{end} exceeds {}",
                self.reg.total_size
            )));
        }
        Ok(offset as usize)
    }

    /// Copy `data` into the UMEM at `offset`.
    ///
    /// The caller must own the chunk under the ring protocol: posted chunks
    /// belong to the datapath until they come back on the RX or completion
    /// ring.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.range(offset, data.len())?;
        // SAFETY: range() bounds the copy inside the region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.region.base.as_ptr().add(start),
                data.len(),
            )
        }
        Ok(())
    }

    /// Copy `len` bytes out of the UMEM at `offset`
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let start = self.range(offset, len)?;
        let mut out = vec![0u8; len];
        // SAFETY: range() bounds the copy inside the region.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.region.base.as_ptr().add(start),
                out.as_mut_ptr(),
                len,
            )
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Umem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Umem")
            .field("total_size", &self.reg.total_size)
            .field("chunk_size", &self.reg.chunk_size)
            .field("headroom", &self.reg.headroom)
            .finish()
    }
}

/// Immutable staging copy of the UMEM with per-chunk in-flight counts
struct TxBounce {
    region: Region,
    tracker: Vec<u16>,
    chunk_size: u64,
}

impl TxBounce {
    fn new(umem: &Umem) -> Result<Self> {
        Ok(Self {
            region: Region::zeroed(umem.region.len())?,
            tracker: vec![0; umem.chunk_count() as usize],
            chunk_size: umem.chunk_size() as u64,
        })
    }

    /// Take a reference on the chunk holding `buffer`, copying the payload
    /// on the first one. Fails when the buffer spans chunks.
    fn bounce(&mut self, umem: &Umem, base: u64, buffer: &Buffer) -> bool {
        let chunk = base / self.chunk_size;
        let last = (base + buffer.buffer_length as u64 - 1) / self.chunk_size;
        if chunk != last {
            return false;
        }
        let Some(references) = self.tracker.get_mut(chunk as usize) else {
            return false;
        };
        let Some(next) = references.checked_add(1) else {
            return false;
        };
        if *references == 0 {
            // Writes to a chunk with frames in flight are ignored.
            umem.region.copy_to(
                &self.region,
                (base + buffer.data_offset as u64) as usize,
                buffer.data_length as usize,
            );
        }
        *references = next;
        true
    }

    fn release(&mut self, relative_address: u64) {
        if let Some(references) = self.tracker.get_mut((relative_address / self.chunk_size) as usize)
        {
            *references = references.saturating_sub(1);
        }
    }
}

/// Element types the application moves through socket rings
pub trait XskRingElement: Copy + sealed::Sealed {
    /// Ring the application produces this element into
    const PRODUCED_ON: XskRingKind;
    /// Ring the application consumes this element from
    const CONSUMED_FROM: XskRingKind;
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u64 {}
    impl Sealed for super::XskBufferDescriptor {}
}

impl XskRingElement for u64 {
    const PRODUCED_ON: XskRingKind = XskRingKind::RxFill;
    const CONSUMED_FROM: XskRingKind = XskRingKind::TxCompletion;
}

impl XskRingElement for XskBufferDescriptor {
    const PRODUCED_ON: XskRingKind = XskRingKind::Tx;
    const CONSUMED_FROM: XskRingKind = XskRingKind::Rx;
}

/// A socket ring with its error slot
pub struct XskRing {
    kind: XskRingKind,
    ring: Ring,
    error: AtomicU32,
}

impl XskRing {
    fn new(kind: XskRingKind, size: u32) -> Result<Self> {
        Ok(Self {
            kind,
            ring: Ring::allocate(kind.element_size(), size, 8)?,
            error: AtomicU32::new(XskError::None as u32),
        })
    }

    /// Which ring this is
    pub fn kind(&self) -> XskRingKind {
        self.kind
    }

    /// The shared ring, for a remote mapper
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Current error state
    pub fn error(&self) -> XskError {
        XskError::from_u32(self.error.load(Ordering::Acquire))
    }

    fn has_error(&self) -> bool {
        self.error() != XskError::None
    }

    /// Mark the ring invalid if the application left its cursors overrun.
    /// Returns whether the datapath may still use the ring.
    fn validate_cursors(&self) -> bool {
        if self.ring.is_overrun() {
            self.set_error(XskError::InvalidRing);
        }
        !self.has_error()
    }

    /// Record `error`; the first error wins
    fn set_error(&self, error: XskError) {
        if self
            .error
            .compare_exchange(
                XskError::None as u32,
                error as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.ring.set_flags(RingFlags::ERROR);
            tracing::warn!(ring = self.kind.name(), ?error, "socket ring marked invalid");
        }
    }

    /// Whether the datapath waits for [`XskNotifyFlags::POKE_TX`]
    pub fn needs_poke(&self) -> bool {
        self.ring.flags().contains(RingFlags::NEED_POKE)
    }

    /// Application side: append `items`. Returns how many fit.
    pub fn produce<T: XskRingElement>(&self, items: &[T]) -> usize {
        if self.kind != T::PRODUCED_ON {
            return 0;
        }
        let count = self.ring.reserve_producer(items.len() as u32);
        let start = self.ring.producer_index();
        for (i, item) in items.iter().take(count as usize).enumerate() {
            // SAFETY: slots in [producer, producer + count) are free and T
            // matches this ring's element type.
            unsafe { self.ring.write(start.wrapping_add(i as u32), *item) };
        }
        self.ring.commit_producer(count);
        count as usize
    }

    /// Application side: take up to `max` elements
    pub fn consume<T: XskRingElement>(&self, max: usize) -> Vec<T> {
        if self.kind != T::CONSUMED_FROM {
            return Vec::new();
        }
        let count = self.ring.peek_consumer(max.min(u32::MAX as usize) as u32);
        let start = self.ring.consumer_index();
        let items = (0..count)
            // SAFETY: slots in [consumer, consumer + count) are filled and T
            // matches this ring's element type.
            .map(|i| unsafe { self.ring.read(start.wrapping_add(i)) })
            .collect();
        self.ring.release_consumer(count);
        items
    }
}

impl std::fmt::Debug for XskRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XskRing")
            .field("kind", &self.kind)
            .field("ring", &self.ring)
            .field("error", &self.error())
            .finish()
    }
}

/// Geometry of the four socket rings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingInfoSet {
    /// Structure header
    pub header: ObjectHeader,
    /// RX ring
    pub rx: Option<RingInfo>,
    /// Fill ring
    pub fill: Option<RingInfo>,
    /// TX ring
    pub tx: Option<RingInfo>,
    /// Completion ring
    pub completion: Option<RingInfo>,
}

impl Versioned for RingInfoSet {
    const REVISION: u8 = 1;
    const REVISION_SIZE: u16 = size_of_u16::<RingInfoSet>();

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

struct RxPath {
    bound_queue: Option<u64>,
    attached: bool,
    umem: Option<Arc<Umem>>,
    zero_copy: bool,
}

struct TxPath {
    active: bool,
    umem: Option<Arc<Umem>>,
    bounce: Option<TxBounce>,
    outstanding: u32,
    rundown: Option<Sender<()>>,
}

#[derive(Default)]
struct Waiter {
    waiting: bool,
    flags: XskNotifyFlags,
    cancelled: bool,
}

/// Socket state shared with the RX and TX queues
pub(crate) struct XskDatapath {
    id: u64,
    rings: [OnceLock<Arc<XskRing>>; 4],
    lifecycle: Mutex<XskState>,
    rx: Mutex<RxPath>,
    tx: Mutex<TxPath>,
    waiter: Mutex<Waiter>,
    wake: Condvar,
    stats: XskStats,
}

impl XskDatapath {
    fn new(id: u64) -> Self {
        Self {
            id,
            rings: Default::default(),
            lifecycle: Mutex::new(XskState::Unbound),
            rx: Mutex::new(RxPath {
                bound_queue: None,
                attached: false,
                umem: None,
                zero_copy: false,
            }),
            tx: Mutex::new(TxPath {
                active: false,
                umem: None,
                bounce: None,
                outstanding: 0,
                rundown: None,
            }),
            waiter: Mutex::new(Waiter::default()),
            wake: Condvar::new(),
            stats: XskStats::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn ring(&self, kind: XskRingKind) -> Option<&Arc<XskRing>> {
        self.rings[kind.index()].get()
    }

    fn state(&self) -> XskState {
        *self.lifecycle.lock()
    }

    fn set_state(&self, state: XskState) {
        *self.lifecycle.lock() = state;
    }

    fn signal(&self, flags: XskNotifyFlags) {
        let waiter = self.waiter.lock();
        if waiter.waiting && waiter.flags.intersects(flags) {
            self.wake.notify_all();
        }
    }

    fn wake_all(&self) {
        let _waiter = self.waiter.lock();
        self.wake.notify_all();
    }

    fn ready(&self, flags: XskNotifyFlags) -> NotifyResult {
        let used = |kind| self.ring(kind).is_some_and(|r| r.ring.used_count() > 0);
        NotifyResult {
            rx_available: flags.contains(XskNotifyFlags::WAIT_RX) && used(XskRingKind::Rx),
            tx_completion_available: flags.contains(XskNotifyFlags::WAIT_TX)
                && used(XskRingKind::TxCompletion),
        }
    }

    /// Deliver a redirect batch from `queue_id`
    pub(crate) fn receive_batch(&self, rings: &RxRings, queue_id: u64, frames: &[(u32, u32)]) {
        let path = self.rx.lock();
        let batch = frames.len() as u32;
        let (Some(rx), Some(fill), Some(umem)) = (
            self.ring(XskRingKind::Rx),
            self.ring(XskRingKind::RxFill),
            path.umem.as_deref(),
        ) else {
            self.stats.record_rx_dropped(batch as u64);
            return;
        };
        if !path.attached
            || path.bound_queue != Some(queue_id)
            || !rx.validate_cursors()
            || !fill.validate_cursors()
        {
            self.stats.record_rx_dropped(batch as u64);
            return;
        }

        let reserved = fill.ring.peek_consumer(rx.ring.reserve_producer(batch));
        let fill_start = fill.ring.consumer_index();
        let rx_start = rx.ring.producer_index();
        let mut produced = 0u32;

        for fill_offset in 0..reserved {
            let (frame_index, fragment_index) = frames[produced as usize];
            // SAFETY: redirected frames stay owned by the RX queue until its
            // receive call returns, which is after this flush.
            let frame = unsafe { rings.frame(frame_index, fragment_index) };
            if self.deliver(
                umem,
                path.zero_copy,
                fill,
                rx,
                &frame,
                fill_start.wrapping_add(fill_offset),
                rx_start.wrapping_add(produced),
            ) {
                produced += 1;
            }
        }

        self.submit_rx(fill, rx, batch, reserved, produced);
    }

    /// Consume every frame of an RX queue batch. Returns false when the
    /// datapath is not attached and the queue must inspect the batch itself.
    pub(crate) fn receive_exclusive(&self, rings: &RxRings) -> bool {
        let path = self.rx.lock();
        if !path.attached {
            return false;
        }

        let frame_ring = &rings.frame_ring;
        let batch = frame_ring.used_count();
        let usable = match (
            self.ring(XskRingKind::Rx),
            self.ring(XskRingKind::RxFill),
            path.umem.as_deref(),
        ) {
            (Some(rx), Some(fill), Some(umem))
                if rx.validate_cursors() && fill.validate_cursors() =>
            {
                Some((rx, fill, umem))
            }
            _ => None,
        };
        let reserved = usable.as_ref().map_or(0, |(rx, fill, _)| {
            fill.ring.peek_consumer(rx.ring.reserve_producer(batch))
        });
        let mut produced = 0u32;

        for index in 0..batch {
            let frame_index = frame_ring.consumer_index();
            let fragment_index = rings.fragment_cursor();
            // SAFETY: frames in [consumer, producer) belong to the queue.
            let frame = unsafe { rings.frame(frame_index, fragment_index) };
            rings.set_action(frame_index, RxAction::Drop);

            if let Some((rx, fill, umem)) = &usable
                && index < reserved
                && self.deliver(
                    umem,
                    path.zero_copy,
                    fill,
                    rx,
                    &frame,
                    fill.ring.consumer_index().wrapping_add(index),
                    rx.ring.producer_index().wrapping_add(produced),
                )
            {
                produced += 1;
            }

            let fragments = frame.fragment_count();
            frame_ring.release_consumer(1);
            if let Some(fragment_ring) = &rings.fragment_ring {
                fragment_ring.release_consumer(fragments);
            }
        }

        match &usable {
            Some((rx, fill, _)) => self.submit_rx(fill, rx, batch, reserved, produced),
            None => self.stats.record_rx_dropped(batch as u64),
        }
        true
    }

    /// Copy one frame into the chunk posted at `fill_slot` and describe it at
    /// `rx_slot`
    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &self,
        umem: &Umem,
        zero_copy: bool,
        fill: &XskRing,
        rx: &XskRing,
        frame: &FrameBuffers<'_>,
        fill_slot: u32,
        rx_slot: u32,
    ) -> bool {
        // SAFETY: fill slots below the peeked count belong to the datapath.
        let address: u64 = unsafe { fill.ring.read(fill_slot) };
        let chunk_size = umem.chunk_size() as u64;
        if address > umem.total_size() - chunk_size {
            self.stats.record_rx_invalid_descriptor();
            return false;
        }

        let headroom = umem.headroom() as usize;
        let capacity = chunk_size as usize - headroom;
        let mut written = 0usize;
        for index in 0..frame.buffer_count() {
            let data = frame.data(index);
            let length = data.len().min(capacity - written);
            if !zero_copy
                && umem
                    .write(address + (headroom + written) as u64, &data[..length])
                    .is_err()
            {
                self.stats.record_rx_invalid_descriptor();
                return false;
            }
            written += length;
            if length < data.len() {
                self.stats.record_rx_truncated();
                break;
            }
        }

        let descriptor = XskBufferDescriptor::new(address, headroom as u16, written as u32);
        // SAFETY: RX slots below the reserved count belong to the datapath.
        unsafe { rx.ring.write(rx_slot, descriptor) };
        true
    }

    fn submit_rx(&self, fill: &XskRing, rx: &XskRing, batch: u32, reserved: u32, produced: u32) {
        if produced < batch {
            self.stats.record_rx_dropped((batch - produced) as u64);
        }
        fill.ring.release_consumer(reserved);
        if produced > 0 {
            rx.ring.commit_producer(produced);
            tracing::trace!(xsk = self.id, produced, "posted RX batch");
            self.signal(XskNotifyFlags::WAIT_RX);
        }
    }

    fn available_tx_completion(&self, completion: &XskRing, outstanding: u32) -> u32 {
        let available = completion.ring.reserve_producer(u32::MAX);
        if available < outstanding {
            completion.set_error(XskError::InvalidRing);
            return 0;
        }
        available - outstanding
    }

    /// Move up to `available` frames from the TX ring into the queue's frame
    /// ring. Returns the number produced.
    pub(crate) fn fill_tx(&self, queue: &TxRings, available: u32) -> u32 {
        let mut guard = self.tx.lock();
        let path = &mut *guard;
        if !path.active {
            return 0;
        }
        let (Some(tx), Some(completion), Some(umem)) = (
            self.ring(XskRingKind::Tx),
            self.ring(XskRingKind::TxCompletion),
            path.umem.as_deref(),
        ) else {
            return 0;
        };
        if !tx.validate_cursors() || !completion.validate_cursors() {
            return 0;
        }

        if (tx.ring.peek_consumer(1) == 0 && path.outstanding == 0)
            || self.available_tx_completion(completion, path.outstanding) == 0
        {
            tx.ring.set_flags(RingFlags::NEED_POKE);
        }

        let tx_available = tx.ring.peek_consumer(u32::MAX);
        let completion_available = self.available_tx_completion(completion, path.outstanding);
        let count = available.min(tx_available).min(completion_available);

        let frame_ring = &queue.frame_ring;
        let extensions = &queue.extensions;
        let max_length = queue
            .capabilities
            .maximum_buffer_size
            .min(queue.capabilities.maximum_frame_size);
        let tx_start = tx.ring.consumer_index();
        let frame_start = frame_ring.producer_index();
        let mut produced = 0u32;

        for i in 0..count {
            // SAFETY: TX slots below the peeked count belong to the datapath.
            let descriptor: XskBufferDescriptor = unsafe { tx.ring.read(tx_start.wrapping_add(i)) };
            let base = descriptor.address.base();
            let offset = descriptor.address.offset() as u32;
            let length = descriptor.length;

            let end = base
                .checked_add(length as u64)
                .and_then(|end| end.checked_add(offset as u64));
            let buffer_length = length.checked_add(offset);
            let (Some(end), Some(buffer_length)) = (end, buffer_length) else {
                self.stats.record_tx_invalid_descriptor();
                continue;
            };
            if end > umem.total_size() || length == 0 || length > max_length {
                self.stats.record_tx_invalid_descriptor();
                continue;
            }

            let buffer = Buffer {
                data_offset: offset,
                data_length: length,
                buffer_length,
                reserved: 0,
            };
            let mapping = match path.bounce.as_mut() {
                Some(bounce) => {
                    if !bounce.bounce(umem, base, &buffer) {
                        self.stats.record_tx_invalid_descriptor();
                        continue;
                    }
                    bounce.region.mapping()
                }
                None => umem.region.mapping(),
            };

            let record = frame_ring.element(frame_start.wrapping_add(produced));
            // SAFETY: frame slots below the flush budget are free, the record
            // layout carries every extension the queue resolved, and base is
            // inside the mapping (checked against the UMEM size above).
            unsafe {
                record.cast::<Buffer>().write(buffer);
                if let Some(va) = extensions.virtual_address {
                    va.field::<BufferVirtualAddress>(record).write(BufferVirtualAddress {
                        virtual_address: mapping.base.as_ptr().add(base as usize),
                    });
                }
                if let Some(la) = extensions.logical_address {
                    la.field::<BufferLogicalAddress>(record).write(BufferLogicalAddress {
                        logical_address: mapping.address + base,
                    });
                }
                if let Some(mdl) = extensions.mdl {
                    mdl.field::<BufferMdl>(record).write(BufferMdl {
                        mdl: mapping.address,
                        mdl_offset: base,
                    });
                }
                extensions
                    .completion_context
                    .field::<TxCompletionContext>(record)
                    .write(TxCompletionContext { context: self.id });
            }
            produced += 1;
        }

        if count > 0 {
            tx.ring.release_consumer(count);
        }
        frame_ring.commit_producer(produced);
        path.outstanding += produced;

        if path.outstanding > 0 && tx.needs_poke() {
            tx.ring.clear_flags(RingFlags::NEED_POKE);
        }
        if produced > 0 {
            tracing::trace!(xsk = self.id, produced, "pulled TX frames");
        }
        produced
    }

    /// Return completed frames to the completion ring. Returns the number
    /// completed.
    pub(crate) fn fill_tx_completion(&self, queue: &TxRings) -> u32 {
        let mut guard = self.tx.lock();
        let path = &mut *guard;
        let (Some(completion), Some(umem)) =
            (self.ring(XskRingKind::TxCompletion), path.umem.as_deref())
        else {
            return 0;
        };
        let mapping = match &path.bounce {
            Some(bounce) => bounce.region.mapping(),
            None => umem.region.mapping(),
        };
        let extensions = &queue.extensions;
        // An invalid ring still drains the queue so the rundown can finish.
        let writable = completion.validate_cursors();
        let start = completion.ring.producer_index();
        let mut count = 0u32;

        let mut complete = |path: &mut TxPath, relative_address: u64| {
            if let Some(bounce) = path.bounce.as_mut() {
                bounce.release(relative_address);
            }
            if writable {
                // SAFETY: completion space was reserved when the frame was
                // pulled.
                unsafe { completion.ring.write(start.wrapping_add(count), relative_address) };
            }
            count += 1;
        };

        match &queue.completion_ring {
            Some(completion_ring) => {
                while completion_ring.used_count() > 0 {
                    let record = completion_ring.element(completion_ring.consumer_index());
                    if let Some(context) = extensions.completion_ring_context {
                        // SAFETY: the completion layout includes the context.
                        let owner = unsafe { context.field::<TxCompletionContext>(record).read() };
                        if owner.context != self.id {
                            break;
                        }
                    }
                    // SAFETY: completion records start with TxFrameCompletion.
                    let address = unsafe { record.cast::<TxFrameCompletion>().read() }.buffer_address;
                    let relative = if extensions.virtual_address.is_some()
                        || extensions.logical_address.is_some()
                    {
                        address.wrapping_sub(mapping.address)
                    } else {
                        address
                    };
                    complete(path, relative);
                    completion_ring.release_consumer(1);
                }
            }
            None => {
                let frame_ring = &queue.frame_ring;
                while frame_ring.reserved_index() != frame_ring.consumer_index() {
                    let record = frame_ring.element(frame_ring.reserved_index());
                    // SAFETY: the frame layout includes the completion context.
                    let owner = unsafe {
                        extensions
                            .completion_context
                            .field::<TxCompletionContext>(record)
                            .read()
                    };
                    if owner.context != self.id {
                        break;
                    }
                    // SAFETY: the extensions checked below are in the buffer
                    // layout of this frame.
                    let relative = unsafe {
                        if let Some(va) = extensions.virtual_address {
                            let va = va.field::<BufferVirtualAddress>(record).read();
                            (va.virtual_address as usize as u64).wrapping_sub(mapping.address)
                        } else if let Some(la) = extensions.logical_address {
                            la.field::<BufferLogicalAddress>(record)
                                .read()
                                .logical_address
                                .wrapping_sub(mapping.address)
                        } else if let Some(mdl) = extensions.mdl {
                            mdl.field::<BufferMdl>(record).read().mdl_offset
                        } else {
                            0
                        }
                    };
                    complete(path, relative);
                    frame_ring.set_reserved_index(frame_ring.reserved_index().wrapping_add(1));
                }
            }
        }

        if count > 0 {
            path.outstanding = path.outstanding.saturating_sub(count);
            if !writable {
                tracing::debug!(xsk = self.id, count, "discarded completions on invalid ring");
            } else if completion.ring.reserve_producer(count) == count {
                completion.ring.commit_producer(count);
            } else {
                completion.set_error(XskError::InvalidRing);
            }
            tracing::trace!(xsk = self.id, count, "completed TX frames");
            self.signal(XskNotifyFlags::WAIT_TX);

            if !path.active && path.outstanding == 0 {
                if let Some(rundown) = path.rundown.take() {
                    let _ = rundown.send(());
                }
            }
        }
        count
    }

    fn on_rx_notification(&self, notification: RxQueueNotification) {
        tracing::debug!(xsk = self.id, ?notification, "RX queue notification");
        match notification {
            RxQueueNotification::Attach => self.rx.lock().attached = true,
            RxQueueNotification::Detach => self.rx.lock().attached = false,
            RxQueueNotification::DetachComplete => {}
            RxQueueNotification::Delete => {
                self.rx.lock().attached = false;
                self.mark_detached();
            }
        }
    }

    /// The TX queue is being deleted with the interface
    pub(crate) fn on_tx_delete(&self) {
        {
            let mut path = self.tx.lock();
            path.active = false;
            // Frames in flight vanish with the queue.
            path.outstanding = 0;
            if let Some(rundown) = path.rundown.take() {
                let _ = rundown.send(());
            }
        }
        self.mark_detached();
    }

    fn mark_detached(&self) {
        {
            let mut state = self.lifecycle.lock();
            if (XskState::Bound..=XskState::Active).contains(&*state) {
                *state = XskState::Detached;
                tracing::info!(xsk = self.id, "socket detached from interface");
            }
        }
        self.wake_all();
    }
}

type BoundQueues = (Option<Arc<RxQueue>>, Option<Arc<TxQueue>>);

struct XskControl {
    umem: Option<Arc<Umem>>,
    binding: Option<Arc<InterfaceBinding>>,
    rx_queue: Option<Arc<RxQueue>>,
    tx_queue: Option<Arc<TxQueue>>,
    observer: Option<u64>,
}

/// Zero-copy socket
pub struct Xsk {
    datapath: Arc<XskDatapath>,
    control: Mutex<XskControl>,
    owner: Weak<State>,
    config: DatapathConfig,
}

impl Xsk {
    /// Create an unbound socket
    pub fn create(state: &Arc<State>) -> Arc<Xsk> {
        let id = next_object_id();
        tracing::debug!(xsk = id, "socket created");
        Arc::new(Xsk {
            datapath: Arc::new(XskDatapath::new(id)),
            control: Mutex::new(XskControl {
                umem: None,
                binding: None,
                rx_queue: None,
                tx_queue: None,
                observer: None,
            }),
            owner: Arc::downgrade(state),
            config: state.config().clone(),
        })
    }

    /// Unique socket id
    pub fn id(&self) -> u64 {
        self.datapath.id
    }

    /// Lifecycle state
    pub fn state(&self) -> XskState {
        self.datapath.state()
    }

    pub(crate) fn datapath(&self) -> &Arc<XskDatapath> {
        &self.datapath
    }

    /// Register the payload area. Unbound sockets only, once.
    pub fn set_umem(&self, reg: UmemReg) -> Result<()> {
        let mut control = self.control.lock();
        if self.state() != XskState::Unbound {
            return Err(DatapathError::InvalidState(
                "UMEM must be registered before bind".into(),
            ));
        }
        if control.umem.is_some() {
            return Err(DatapathError::InvalidState("UMEM already registered".into()));
        }
        let umem = Umem::new(reg)?;
        tracing::debug!(xsk = self.id(), ?umem, "UMEM registered");
        control.umem = Some(Arc::new(umem));
        Ok(())
    }

    /// Registered payload area
    pub fn umem(&self) -> Option<Arc<Umem>> {
        self.control.lock().umem.clone()
    }

    /// Size a ring. Each ring is sized once, before activation.
    pub fn set_ring_size(&self, kind: XskRingKind, size: u32) -> Result<()> {
        let _control = self.control.lock();
        if self.state() >= XskState::Activating {
            return Err(DatapathError::InvalidState(format!(
                "{} ring cannot be sized after activation",
                kind.name()
            )));
        }
        if size == 0 || !size.is_power_of_two() {
            return Err(DatapathError::InvalidParameter(format!(
                "{} ring size {size} must be a power of two",
                kind.name()
            )));
        }
        let slot = &self.datapath.rings[kind.index()];
        if slot.get().is_some() {
            return Err(DatapathError::InvalidState(format!(
                "{} ring already sized",
                kind.name()
            )));
        }
        let ring = Arc::new(XskRing::new(kind, size)?);
        if slot.set(ring).is_err() {
            return Err(DatapathError::InvalidState(format!(
                "{} ring already sized",
                kind.name()
            )));
        }
        Ok(())
    }

    /// A sized ring
    pub fn ring(&self, kind: XskRingKind) -> Option<Arc<XskRing>> {
        self.datapath.ring(kind).cloned()
    }

    /// Bind to the queues `queue_id` of interface `if_index`
    pub fn bind(&self, if_index: u32, queue_id: u32, flags: XskBindFlags) -> Result<()> {
        let mut control = self.control.lock();
        if self.state() != XskState::Unbound {
            return Err(DatapathError::InvalidState("socket already bound".into()));
        }
        if !flags.intersects(XskBindFlags::RX | XskBindFlags::TX) {
            return Err(DatapathError::InvalidParameter(
                "bind needs at least one of RX and TX".into(),
            ));
        }
        if flags.contains(XskBindFlags::GENERIC | XskBindFlags::NATIVE) {
            return Err(DatapathError::InvalidParameter(
                "bind accepts at most one of GENERIC and NATIVE".into(),
            ));
        }

        let state = self
            .owner
            .upgrade()
            .ok_or_else(|| DatapathError::DeviceRemoved("datapath shut down".into()))?;
        let binding = state.binding(if_index)?;
        check_mode(
            flags.contains(XskBindFlags::GENERIC),
            flags.contains(XskBindFlags::NATIVE),
            binding.mode(),
        )?;

        self.datapath.set_state(XskState::Binding);

        let job = binding.clone();
        let queues = binding.work_queue().run(move || -> Result<BoundQueues> {
            let rx = if flags.contains(XskBindFlags::RX) {
                Some(job.find_or_create_rx_queue(HookId::RX_INSPECT, queue_id)?)
            } else {
                None
            };
            let tx = if flags.contains(XskBindFlags::TX) {
                Some(job.find_or_create_tx_queue(HookId::TX_INJECT, queue_id)?)
            } else {
                None
            };
            Ok((rx, tx))
        });

        match queues.and_then(|result| result) {
            Ok((rx, tx)) => {
                if let Some(rx) = &rx {
                    self.datapath.rx.lock().bound_queue = Some(rx.id());
                }
                control.rx_queue = rx;
                control.tx_queue = tx;
                control.binding = Some(binding);
                self.datapath.set_state(XskState::Bound);
                tracing::info!(xsk = self.id(), if_index, queue_id, ?flags, "socket bound");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(xsk = self.id(), if_index, queue_id, error = %e, "bind failed");
                self.datapath.set_state(XskState::Unbound);
                Err(e)
            }
        }
    }

    /// Start moving frames. Bound sockets with a UMEM and the rings of
    /// every bound direction only.
    pub fn activate(&self) -> Result<()> {
        let mut control = self.control.lock();
        if self.state() != XskState::Bound {
            return Err(DatapathError::InvalidState("socket is not bound".into()));
        }
        let umem = control
            .umem
            .clone()
            .ok_or_else(|| DatapathError::InvalidState("no UMEM registered".into()))?;
        let has = |kind| self.datapath.ring(kind).is_some();
        if control.rx_queue.is_some() && !(has(XskRingKind::Rx) && has(XskRingKind::RxFill)) {
            return Err(DatapathError::InvalidState(
                "RX binding needs RX and fill rings".into(),
            ));
        }
        if control.tx_queue.is_some() && !(has(XskRingKind::Tx) && has(XskRingKind::TxCompletion))
        {
            return Err(DatapathError::InvalidState(
                "TX binding needs TX and completion rings".into(),
            ));
        }

        self.datapath.set_state(XskState::Activating);
        match self.activate_paths(&mut control, &umem) {
            Ok(()) => {
                self.datapath.set_state(XskState::Active);
                tracing::info!(xsk = self.id(), "socket active");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(xsk = self.id(), error = %e, "activation failed, rolling back");
                self.datapath.tx.lock().active = false;
                if let Some(tx_queue) = &control.tx_queue {
                    tx_queue.remove_client(self.id());
                }
                self.datapath.set_state(XskState::Bound);
                Err(e)
            }
        }
    }

    fn activate_paths(&self, control: &mut XskControl, umem: &Arc<Umem>) -> Result<()> {
        let binding = control
            .binding
            .clone()
            .ok_or_else(|| DatapathError::InvalidState("socket is not bound".into()))?;

        if let Some(tx_queue) = control.tx_queue.clone() {
            let bounce = if !self.config.disable_tx_bounce
                && binding.mode() == InterfaceMode::Generic
            {
                Some(TxBounce::new(umem)?)
            } else {
                None
            };
            {
                let mut path = self.datapath.tx.lock();
                path.umem = Some(umem.clone());
                path.bounce = bounce;
                path.outstanding = 0;
                path.active = true;
            }
            if let Some(tx) = self.datapath.ring(XskRingKind::Tx) {
                tx.ring.set_flags(RingFlags::NEED_POKE);
            }
            let client = self.datapath.clone();
            binding
                .work_queue()
                .run(move || tx_queue.add_client(client))??;
        }

        if let Some(rx_queue) = control.rx_queue.clone() {
            {
                let mut path = self.datapath.rx.lock();
                path.umem = Some(umem.clone());
                path.zero_copy = self.config.rx_zero_copy;
            }
            let datapath = self.datapath.clone();
            let observer: RxQueueObserver =
                Arc::new(move |_: &RxQueue, notification: RxQueueNotification| {
                    datapath.on_rx_notification(notification)
                });
            let id = binding
                .work_queue()
                .run(move || rx_queue.register_notifications(observer))?;
            control.observer = Some(id);
        }
        Ok(())
    }

    /// Geometry of every sized ring
    pub fn ring_info(&self) -> Result<RingInfoSet> {
        let info = |kind| self.datapath.ring(kind).map(|r| r.ring.info());
        let set = RingInfoSet {
            header: RingInfoSet::current_header(),
            rx: info(XskRingKind::Rx),
            fill: info(XskRingKind::RxFill),
            tx: info(XskRingKind::Tx),
            completion: info(XskRingKind::TxCompletion),
        };
        if XskRingKind::ALL.iter().all(|kind| self.datapath.ring(*kind).is_none()) {
            return Err(DatapathError::InvalidState("no ring has been sized".into()));
        }
        Ok(set)
    }

    /// Poke the TX path and/or wait for ring readiness. Only one caller may
    /// wait at a time.
    pub fn notify(&self, flags: XskNotifyFlags, timeout: Duration) -> Result<NotifyResult> {
        if self.state() != XskState::Active {
            return Err(DatapathError::InvalidState("socket is not active".into()));
        }

        if flags.contains(XskNotifyFlags::POKE_TX) {
            let queue = self.control.lock().tx_queue.clone();
            let active = self.datapath.tx.lock().active;
            match queue {
                Some(queue) if active => {
                    if let Some(tx) = self.datapath.ring(XskRingKind::Tx) {
                        tx.ring.clear_flags(RingFlags::NEED_POKE);
                    }
                    queue.notify();
                }
                _ => {
                    return Err(DatapathError::DeviceRemoved(
                        "TX path is not active".into(),
                    ));
                }
            }
        }

        let wait = flags & (XskNotifyFlags::WAIT_RX | XskNotifyFlags::WAIT_TX);
        if wait.is_empty() {
            return Ok(NotifyResult::default());
        }

        let deadline = Instant::now() + timeout;
        let mut waiter = self.datapath.waiter.lock();
        if waiter.waiting {
            return Err(DatapathError::InvalidState("another waiter is pending".into()));
        }
        waiter.waiting = true;
        waiter.flags = wait;
        waiter.cancelled = false;

        let result = loop {
            let ready = self.datapath.ready(wait);
            if ready.any() {
                break Ok(ready);
            }
            if waiter.cancelled {
                break Err(DatapathError::Cancelled);
            }
            if self.datapath.state() != XskState::Active {
                break Err(DatapathError::DeviceRemoved("socket detached".into()));
            }
            if self
                .datapath
                .wake
                .wait_until(&mut waiter, deadline)
                .timed_out()
            {
                let ready = self.datapath.ready(wait);
                break if ready.any() {
                    Ok(ready)
                } else {
                    Err(DatapathError::Timeout)
                };
            }
        };

        waiter.waiting = false;
        waiter.cancelled = false;
        result
    }

    /// Wake a pending [`Xsk::notify`] with [`DatapathError::Cancelled`]
    pub fn cancel_notify(&self) {
        let mut waiter = self.datapath.waiter.lock();
        if waiter.waiting {
            waiter.cancelled = true;
            self.datapath.wake.notify_all();
        }
    }

    /// Datapath counters
    pub fn statistics(&self) -> XskStatistics {
        self.datapath.stats.snapshot()
    }

    /// Error state of a sized ring
    pub fn ring_error(&self, kind: XskRingKind) -> Result<XskError> {
        self.datapath
            .ring(kind)
            .map(|ring| ring.error())
            .ok_or_else(|| DatapathError::InvalidParameter(format!("{} ring not sized", kind.name())))
    }

    /// TX frames handed to the interface and not yet completed
    pub fn outstanding_tx(&self) -> u32 {
        self.datapath.tx.lock().outstanding
    }

    /// In-flight references on a bounce-buffer chunk, when bouncing
    pub fn tx_bounce_references(&self, chunk: usize) -> Option<u16> {
        self.datapath
            .tx
            .lock()
            .bounce
            .as_ref()
            .and_then(|bounce| bounce.tracker.get(chunk).copied())
    }

    /// Whether redirect rules on `rx` may hand whole batches to this socket
    pub(crate) fn can_bypass(&self, rx: &RxQueue) -> bool {
        let state = self.state();
        let path = self.datapath.rx.lock();
        (state > XskState::Active && !path.attached) || path.bound_queue == Some(rx.id())
    }

    /// Check that a redirect rule on `rx` can target this socket
    pub(crate) fn validate_redirect(&self, rx: &RxQueue) -> Result<()> {
        if self.state() < XskState::Bound {
            return Err(DatapathError::InvalidState(format!(
                "redirect target socket {} is not bound",
                self.id()
            )));
        }
        if self.datapath.rx.lock().bound_queue != Some(rx.id()) {
            return Err(DatapathError::InvalidParameter(format!(
                "redirect target socket {} is not bound to RX queue {}",
                self.id(),
                rx.queue_id()
            )));
        }
        Ok(())
    }

    /// Detach from every queue. Called on drop.
    pub fn close(&self) {
        let mut control = self.control.lock();
        if self.state() == XskState::Closing {
            return;
        }
        self.datapath.set_state(XskState::Closing);

        {
            let mut path = self.datapath.rx.lock();
            path.attached = false;
            path.bound_queue = None;
        }
        if let (Some(rx_queue), Some(observer)) = (control.rx_queue.take(), control.observer.take())
        {
            rx_queue.deregister_notifications(observer);
        }
        if let Some(tx_queue) = control.tx_queue.take() {
            self.detach_tx(&tx_queue);
            if let Some(binding) = control.binding.clone() {
                let job_binding = binding.clone();
                if let Err(e) = binding
                    .work_queue()
                    .run(move || job_binding.release_tx_queue(&tx_queue))
                {
                    tracing::debug!(xsk = self.id(), error = %e, "TX queue already gone");
                }
            }
        }
        control.binding = None;
        self.datapath.wake_all();
        tracing::debug!(xsk = self.id(), "socket closed");
    }

    fn detach_tx(&self, tx_queue: &Arc<TxQueue>) {
        let rundown = {
            let mut path = self.datapath.tx.lock();
            path.active = false;
            if path.outstanding > 0 {
                let (done, wait) = crossbeam_channel::bounded(1);
                path.rundown = Some(done);
                Some(wait)
            } else {
                None
            }
        };

        if let Some(wait) = rundown {
            tx_queue.notify();
            if wait.recv_timeout(TX_RUNDOWN_TIMEOUT).is_err() {
                tracing::warn!(
                    xsk = self.id(),
                    outstanding = self.outstanding_tx(),
                    "TX rundown timed out"
                );
            }
        }
        tx_queue.remove_client(self.id());
    }
}

impl Drop for Xsk {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Xsk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xsk")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Reject a GENERIC or NATIVE request the interface cannot honor
pub(crate) fn check_mode(generic: bool, native: bool, mode: InterfaceMode) -> Result<()> {
    match (generic, native, mode) {
        (true, true, _) => Err(DatapathError::InvalidParameter(
            "at most one of GENERIC and NATIVE".into(),
        )),
        (true, _, InterfaceMode::Native) => Err(DatapathError::InvalidParameter(
            "interface is not in generic mode".into(),
        )),
        (_, true, InterfaceMode::Generic) => Err(DatapathError::InvalidParameter(
            "interface is not in native mode".into(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn umem(total: u64, chunk: u32, headroom: u32) -> Umem {
        Umem::new(UmemReg::new(total, chunk, headroom)).unwrap()
    }

    #[test]
    fn test_umem_registration_bounds() {
        assert!(Umem::new(UmemReg::new(0, 2048, 0)).is_err());
        assert!(Umem::new(UmemReg::new(u32::MAX as u64 + 1, 2048, 0)).is_err());
        assert!(Umem::new(UmemReg::new(4096, 0, 0)).is_err());
        assert!(Umem::new(UmemReg::new(4096, 8192, 0)).is_err());
        assert!(Umem::new(UmemReg::new(4096, 2048, 4096)).is_err());

        let mut reg = UmemReg::new(4096, 2048, 0);
        reg.header.revision = 0;
        assert!(Umem::new(reg).is_err());
    }

    #[test]
    fn test_umem_discards_partial_chunk() {
        let umem = umem(5000, 2048, 128);
        assert_eq!(umem.total_size(), 4096);
        assert_eq!(umem.chunk_count(), 2);
        assert_eq!(umem.headroom(), 128);
    }

    #[test]
    fn test_umem_read_write_bounds() {
        let umem = umem(4096, 2048, 0);
        umem.write(2040, b"sluice!!").unwrap();
        assert_eq!(umem.read(2040, 8).unwrap(), b"sluice!!");
        assert!(umem.write(4090, b"overflow").is_err());
        assert!(umem.read(u64::MAX, 2).is_err());
    }

    #[test]
    fn test_buffer_address_packing() {
        let address = XskBufferAddress::new(0x1234_5678_9abc, 256);
        assert_eq!(address.base(), 0x1234_5678_9abc);
        assert_eq!(address.offset(), 256);
        assert_eq!(XskBufferAddress::new(u64::MAX, 0).base(), ADDRESS_BASE_MASK);
        assert_eq!(size_of::<XskBufferDescriptor>(), 16);
    }

    #[test]
    fn test_bounce_copies_on_first_reference() {
        let umem = umem(8192, 2048, 0);
        let mut bounce = TxBounce::new(&umem).unwrap();
        let buffer = Buffer {
            data_offset: 0,
            data_length: 4,
            buffer_length: 4,
            reserved: 0,
        };

        umem.write(2048, b"aaaa").unwrap();
        assert!(bounce.bounce(&umem, 2048, &buffer));
        umem.write(2048, b"bbbb").unwrap();
        assert!(bounce.bounce(&umem, 2048, &buffer));
        assert_eq!(bounce.tracker[1], 2);

        // SAFETY: test-only read of 4 bytes inside the bounce region.
        let staged = unsafe { std::slice::from_raw_parts(bounce.region.base.as_ptr().add(2048), 4) };
        assert_eq!(staged, b"aaaa");

        bounce.release(2048);
        bounce.release(2048);
        assert_eq!(bounce.tracker[1], 0);
        bounce.release(2048);
        assert_eq!(bounce.tracker[1], 0);
    }

    #[test]
    fn test_bounce_rejects_chunk_spanning_buffer() {
        let umem = umem(8192, 2048, 0);
        let mut bounce = TxBounce::new(&umem).unwrap();
        let buffer = Buffer {
            data_offset: 0,
            data_length: 100,
            buffer_length: 100,
            reserved: 0,
        };
        assert!(!bounce.bounce(&umem, 2000, &buffer));
        assert!(bounce.tracker.iter().all(|r| *r == 0));
    }

    #[test]
    fn test_ring_produce_consume_typed() {
        let fill = XskRing::new(XskRingKind::RxFill, 4).unwrap();
        assert_eq!(fill.produce(&[0u64, 2048, 4096, 6144, 8192]), 4);
        assert_eq!(fill.produce(&[XskBufferDescriptor::default()]), 0);
        assert!(fill.consume::<u64>(4).is_empty());

        let rx = XskRing::new(XskRingKind::Rx, 4).unwrap();
        let descriptor = XskBufferDescriptor::new(2048, 64, 60);
        unsafe { rx.ring.write(0, descriptor) };
        rx.ring.commit_producer(1);
        assert_eq!(rx.consume::<XskBufferDescriptor>(8), vec![descriptor]);
        assert_eq!(rx.ring.used_count(), 0);
    }

    #[test]
    fn test_first_ring_error_wins() {
        let ring = XskRing::new(XskRingKind::TxCompletion, 8).unwrap();
        assert_eq!(ring.error(), XskError::None);
        ring.set_error(XskError::InvalidRing);
        assert_eq!(ring.error(), XskError::InvalidRing);
        assert!(ring.ring.flags().contains(RingFlags::ERROR));
    }

    #[test]
    fn test_check_mode() {
        assert!(check_mode(false, false, InterfaceMode::Native).is_ok());
        assert!(check_mode(true, false, InterfaceMode::Generic).is_ok());
        assert!(check_mode(true, false, InterfaceMode::Native).is_err());
        assert!(check_mode(false, true, InterfaceMode::Generic).is_err());
        assert!(check_mode(true, true, InterfaceMode::Generic).is_err());
    }

    #[test]
    fn test_socket_configuration_rules() {
        let state = State::new(DatapathConfig::default()).unwrap();
        let xsk = Xsk::create(&state);
        assert_eq!(xsk.state(), XskState::Unbound);

        assert!(xsk.set_ring_size(XskRingKind::Rx, 6).is_err());
        xsk.set_ring_size(XskRingKind::Rx, 8).unwrap();
        assert!(xsk.set_ring_size(XskRingKind::Rx, 16).is_err());
        assert!(xsk.ring_error(XskRingKind::Tx).is_err());
        assert_eq!(xsk.ring_error(XskRingKind::Rx).unwrap(), XskError::None);

        xsk.set_umem(UmemReg::new(16 * 2048, 2048, 0)).unwrap();
        assert!(xsk.set_umem(UmemReg::new(16 * 2048, 2048, 0)).is_err());

        let info = xsk.ring_info().unwrap();
        assert_eq!(info.rx.unwrap().size, 8);
        assert!(info.tx.is_none());

        assert!(xsk.activate().is_err());
        assert!(matches!(
            xsk.notify(XskNotifyFlags::WAIT_RX, Duration::ZERO),
            Err(DatapathError::InvalidState(_))
        ));
        assert!(xsk.bind(7, 0, XskBindFlags::empty()).is_err());
        assert!(matches!(
            xsk.bind(7, 0, XskBindFlags::RX),
            Err(DatapathError::NotFound(_))
        ));
        assert_eq!(xsk.state(), XskState::Unbound);
    }
}
