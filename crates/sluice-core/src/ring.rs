//! Fixed-stride circular queue shared between one producer side and one
//! consumer side.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────── 64 bytes ─────────────────────┐
//! │ producer │ consumer │ reserved │ flags │ mask │ stride │ pad │
//! ├───────────────────────────────────────────────────┤
//! │ element 0 │ element 1 │ ... │ element mask        │
//! └───────────────────────────────────────────────────┘
//! ```
//!
//! Indices are free-running `u32` counters; the slot of index `i` is
//! `i & mask`. Wrapping is defined behavior, so `producer - consumer` is always
//! the number of filled slots and never exceeds the capacity.
//!
//! The producer publishes with a `Release` store after writing elements, and
//! the consumer reads the producer cursor with `Acquire` before reading them.
//! The same pairing applies in the other direction for freed slots.
//!
//! ## Multi-producer use
//!
//! [`Ring::reserve_producer_mp`] claims slots by compare-exchange on the
//! `reserved` cursor. [`Ring::commit_producer_mp`] then waits until the
//! visible producer cursor reaches the claimed start, which keeps publication
//! in reservation order. Rings used in multi-producer mode must not use the
//! `reserved` cursor for anything else.

use crate::error::{CoreError, Result};
use crate::header::{ObjectHeader, Versioned, size_of_u16};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::mem::{offset_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

/// Alignment of the ring header and upper bound on element alignment
pub const RING_ALIGNMENT: usize = 64;

/// Largest element alignment a ring accepts
pub const MAX_ELEMENT_ALIGNMENT: u8 = 64;

bitflags! {
    /// Flags shared with the remote side of a ring
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RingFlags: u32 {
        /// The ring entered a permanent error state
        const ERROR = 0x1;
        /// The consumer needs an explicit poke to make progress
        const NEED_POKE = 0x2;
    }
}

#[repr(C, align(64))]
struct RingHeader {
    producer_index: AtomicU32,
    consumer_index: AtomicU32,
    reserved_index: AtomicU32,
    flags: AtomicU32,
    mask: u32,
    element_stride: u32,
}

const HEADER_SIZE: usize = size_of::<RingHeader>();

/// Lock-free fixed-stride ring
pub struct Ring {
    base: NonNull<u8>,
    layout: Layout,
    mask: u32,
    stride: u32,
}

// SAFETY: all shared header state is atomic. Element memory is only touched
// by the side that owns the slot under the cursor protocol, and callers of the
// unsafe element accessors uphold that contract.
unsafe impl Send for Ring {}
// SAFETY: see above.
unsafe impl Sync for Ring {}

impl Ring {
    /// Allocate a ring of at least `element_count` elements of `element_size`
    /// bytes, each aligned to `alignment`.
    ///
    /// The count is rounded up to a power of two and the stride up to the
    /// alignment.
    pub fn allocate(element_size: u32, element_count: u32, alignment: u8) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() || alignment > MAX_ELEMENT_ALIGNMENT {
            return Err(CoreError::InvalidParameter(format!(
                "ring alignment {alignment} must be a power of two <= {MAX_ELEMENT_ALIGNMENT}"
            )));
        }
        if element_size == 0 || element_count == 0 {
            return Err(CoreError::InvalidParameter(
                "ring element size and count must be non-zero".into(),
            ));
        }

        let stride = align_up_u32(element_size, alignment as u32)
            .ok_or(CoreError::IntegerOverflow("ring element stride"))?;
        let count = element_count
            .checked_next_power_of_two()
            .ok_or(CoreError::IntegerOverflow("ring element count"))?;
        let bytes = (stride as usize)
            .checked_mul(count as usize)
            .and_then(|b| b.checked_add(HEADER_SIZE))
            .ok_or(CoreError::IntegerOverflow("ring allocation size"))?;
        let layout = Layout::from_size_align(bytes, RING_ALIGNMENT)
            .map_err(|e| CoreError::InvalidParameter(e.to_string()))?;

        // SAFETY: layout has non-zero size (it always includes the header).
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw)
            .ok_or_else(|| CoreError::Allocation(format!("ring of {bytes} bytes")))?;

        // SAFETY: base is a fresh allocation aligned to 64 and at least
        // HEADER_SIZE bytes long.
        unsafe {
            base.cast::<RingHeader>().write(RingHeader {
                producer_index: AtomicU32::new(0),
                consumer_index: AtomicU32::new(0),
                reserved_index: AtomicU32::new(0),
                flags: AtomicU32::new(0),
                mask: count - 1,
                element_stride: stride,
            });
        }

        tracing::trace!(stride, count, bytes, "allocated ring");

        Ok(Self {
            base,
            layout,
            mask: count - 1,
            stride,
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: the header was written in allocate() and lives as long as self.
        unsafe { self.base.cast::<RingHeader>().as_ref() }
    }

    /// Number of element slots
    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// Index mask (`capacity - 1`)
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Distance in bytes between consecutive elements
    pub fn element_stride(&self) -> u32 {
        self.stride
    }

    /// Current producer cursor
    pub fn producer_index(&self) -> u32 {
        self.header().producer_index.load(Ordering::Acquire)
    }

    /// Current consumer cursor
    pub fn consumer_index(&self) -> u32 {
        self.header().consumer_index.load(Ordering::Acquire)
    }

    /// Current reserved cursor
    pub fn reserved_index(&self) -> u32 {
        self.header().reserved_index.load(Ordering::Acquire)
    }

    /// Store the producer cursor
    pub fn set_producer_index(&self, index: u32) {
        self.header().producer_index.store(index, Ordering::Release);
    }

    /// Store the consumer cursor
    pub fn set_consumer_index(&self, index: u32) {
        self.header().consumer_index.store(index, Ordering::Release);
    }

    /// Store the reserved cursor
    pub fn set_reserved_index(&self, index: u32) {
        self.header().reserved_index.store(index, Ordering::Release);
    }

    /// Filled slots
    pub fn used_count(&self) -> u32 {
        self.producer_index().wrapping_sub(self.consumer_index())
    }

    /// Free slots
    pub fn free_count(&self) -> u32 {
        self.capacity().saturating_sub(self.used_count())
    }

    /// Whether the cursors claim more filled slots than the ring holds.
    ///
    /// Only possible when a side that does not own a cursor has stored into
    /// it; every count below saturates in that case.
    pub fn is_overrun(&self) -> bool {
        self.used_count() > self.capacity()
    }

    /// Number of slots, up to `count`, the producer may fill
    pub fn reserve_producer(&self, count: u32) -> u32 {
        let header = self.header();
        let consumer = header.consumer_index.load(Ordering::Acquire);
        let producer = header.producer_index.load(Ordering::Relaxed);
        let free = self.capacity().saturating_sub(producer.wrapping_sub(consumer));
        free.min(count)
    }

    /// Number of filled slots, up to `count`, the consumer may read
    pub fn peek_consumer(&self, count: u32) -> u32 {
        let header = self.header();
        let producer = header.producer_index.load(Ordering::Acquire);
        let consumer = header.consumer_index.load(Ordering::Relaxed);
        producer
            .wrapping_sub(consumer)
            .min(self.capacity())
            .min(count)
    }

    /// Publish `count` produced elements
    pub fn commit_producer(&self, count: u32) {
        self.header()
            .producer_index
            .fetch_add(count, Ordering::Release);
    }

    /// Return `count` consumed slots to the producer
    pub fn release_consumer(&self, count: u32) {
        self.header()
            .consumer_index
            .fetch_add(count, Ordering::Release);
    }

    /// Claim up to `count` slots among concurrent producers.
    ///
    /// Returns the first claimed index and the number of slots claimed, or
    /// `None` when the ring is full.
    pub fn reserve_producer_mp(&self, count: u32) -> Option<(u32, u32)> {
        let header = self.header();
        let mut reserved = header.reserved_index.load(Ordering::Relaxed);
        loop {
            let consumer = header.consumer_index.load(Ordering::Acquire);
            let free = self
                .capacity()
                .saturating_sub(reserved.wrapping_sub(consumer));
            let claimed = free.min(count);
            if claimed == 0 {
                return None;
            }
            match header.reserved_index.compare_exchange_weak(
                reserved,
                reserved.wrapping_add(claimed),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some((reserved, claimed)),
                Err(actual) => reserved = actual,
            }
        }
    }

    /// Publish slots claimed by [`Ring::reserve_producer_mp`], in claim order
    pub fn commit_producer_mp(&self, start: u32, count: u32) {
        let header = self.header();
        while header.producer_index.load(Ordering::Acquire) != start {
            std::hint::spin_loop();
        }
        header
            .producer_index
            .store(start.wrapping_add(count), Ordering::Release);
    }

    /// Pointer to the element slot for `index`
    pub fn element(&self, index: u32) -> NonNull<u8> {
        let offset = HEADER_SIZE + (index & self.mask) as usize * self.stride as usize;
        // SAFETY: (index & mask) < capacity, so offset is inside the allocation.
        unsafe { self.base.add(offset) }
    }

    /// Read the element at `index` as a `T`.
    ///
    /// # Safety
    ///
    /// The caller must own the slot under the cursor protocol, `T` must fit in
    /// the stride, and the ring alignment must satisfy `T`'s alignment.
    pub unsafe fn read<T: Copy>(&self, index: u32) -> T {
        debug_assert!(size_of::<T>() <= self.stride as usize);
        // SAFETY: upheld by the caller.
        unsafe { self.element(index).cast::<T>().read() }
    }

    /// Write a `T` into the element at `index`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::read`].
    pub unsafe fn write<T: Copy>(&self, index: u32, value: T) {
        debug_assert!(size_of::<T>() <= self.stride as usize);
        // SAFETY: upheld by the caller.
        unsafe { self.element(index).cast::<T>().write(value) }
    }

    /// Current shared flags
    pub fn flags(&self) -> RingFlags {
        RingFlags::from_bits_truncate(self.header().flags.load(Ordering::Acquire))
    }

    /// Atomically set flags
    pub fn set_flags(&self, flags: RingFlags) {
        self.header()
            .flags
            .fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Atomically clear flags
    pub fn clear_flags(&self, flags: RingFlags) {
        self.header()
            .flags
            .fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Base address of the mapped ring, for a remote mapper
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// Offsets and geometry a remote mapper needs to drive this ring
    pub fn info(&self) -> RingInfo {
        RingInfo {
            header: RingInfo::current_header(),
            descriptors_offset: HEADER_SIZE as u32,
            producer_index_offset: offset_of!(RingHeader, producer_index) as u32,
            consumer_index_offset: offset_of!(RingHeader, consumer_index) as u32,
            flags_offset: offset_of!(RingHeader, flags) as u32,
            size: self.capacity(),
            element_stride: self.stride,
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // SAFETY: base was allocated in allocate() with self.layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) }
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring")
            .field("capacity", &self.capacity())
            .field("stride", &self.stride)
            .field("producer", &self.producer_index())
            .field("consumer", &self.consumer_index())
            .finish()
    }
}

/// Geometry of a ring as seen by a remote mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingInfo {
    /// Structure header
    pub header: ObjectHeader,
    /// Offset of element 0 from the ring base
    pub descriptors_offset: u32,
    /// Offset of the producer cursor
    pub producer_index_offset: u32,
    /// Offset of the consumer cursor
    pub consumer_index_offset: u32,
    /// Offset of the shared flags word
    pub flags_offset: u32,
    /// Number of elements
    pub size: u32,
    /// Distance in bytes between elements
    pub element_stride: u32,
}

impl Versioned for RingInfo {
    const REVISION: u8 = 1;
    const REVISION_SIZE: u16 = size_of_u16::<RingInfo>();

    fn header(&self) -> &ObjectHeader {
        &self.header
    }
}

/// Round `value` up to a multiple of the power-of-two `alignment`
pub fn align_up_u32(value: u32, alignment: u32) -> Option<u32> {
    debug_assert!(alignment.is_power_of_two());
    value
        .checked_add(alignment - 1)
        .map(|v| v & !(alignment - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_count_and_stride() {
        let ring = Ring::allocate(12, 5, 8).unwrap();
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.mask(), 7);
        assert_eq!(ring.element_stride(), 16);
        assert_eq!(ring.as_ptr() as usize % RING_ALIGNMENT, 0);
    }

    #[test]
    fn test_allocate_rejects_bad_alignment() {
        assert!(Ring::allocate(8, 8, 3).is_err());
        assert!(Ring::allocate(8, 8, 128).is_err());
        assert!(Ring::allocate(8, 8, 0).is_err());
    }

    #[test]
    fn test_allocate_rejects_overflow() {
        let err = Ring::allocate(u32::MAX, 8, 64).unwrap_err();
        assert!(matches!(err, CoreError::IntegerOverflow(_)));
        let err = Ring::allocate(8, u32::MAX, 8).unwrap_err();
        assert!(matches!(err, CoreError::IntegerOverflow(_)));
    }

    #[test]
    fn test_reserve_commit_peek_release() {
        let ring = Ring::allocate(8, 4, 8).unwrap();

        assert_eq!(ring.reserve_producer(10), 4);
        for i in 0..3u32 {
            unsafe { ring.write::<u64>(i, u64::from(i) * 10) };
        }
        ring.commit_producer(3);
        assert_eq!(ring.used_count(), 3);
        assert_eq!(ring.reserve_producer(10), 1);

        assert_eq!(ring.peek_consumer(2), 2);
        assert_eq!(ring.peek_consumer(10), 3);
        let first: u64 = unsafe { ring.read(0) };
        assert_eq!(first, 0);
        let third: u64 = unsafe { ring.read(2) };
        assert_eq!(third, 20);

        ring.release_consumer(3);
        assert_eq!(ring.peek_consumer(10), 0);
        assert_eq!(ring.free_count(), 4);
    }

    #[test]
    fn test_indices_wrap() {
        let ring = Ring::allocate(4, 4, 4).unwrap();
        ring.set_producer_index(u32::MAX - 1);
        ring.set_consumer_index(u32::MAX - 1);

        assert_eq!(ring.reserve_producer(4), 4);
        ring.commit_producer(3);
        assert_eq!(ring.producer_index(), 1);
        assert_eq!(ring.used_count(), 3);
        assert_eq!(ring.peek_consumer(8), 3);
        ring.release_consumer(3);
        assert_eq!(ring.used_count(), 0);
    }

    #[test]
    fn test_counts_saturate_on_overrun() {
        let ring = Ring::allocate(8, 4, 8).unwrap();
        ring.commit_producer(2);
        // Consumer stored past the producer.
        ring.set_consumer_index(3);
        assert!(ring.is_overrun());
        assert_eq!(ring.free_count(), 0);
        assert_eq!(ring.reserve_producer(4), 0);
        assert_eq!(ring.reserve_producer_mp(4), None);
        assert_eq!(ring.peek_consumer(u32::MAX), 4);

        ring.set_consumer_index(2);
        assert!(!ring.is_overrun());
        assert_eq!(ring.free_count(), 4);
    }

    #[test]
    fn test_element_slots_wrap_by_mask() {
        let ring = Ring::allocate(8, 4, 8).unwrap();
        assert_eq!(ring.element(0), ring.element(4));
        assert_ne!(ring.element(0), ring.element(1));
    }

    #[test]
    fn test_flags() {
        let ring = Ring::allocate(8, 4, 8).unwrap();
        assert!(ring.flags().is_empty());
        ring.set_flags(RingFlags::NEED_POKE);
        ring.set_flags(RingFlags::ERROR);
        assert!(ring.flags().contains(RingFlags::NEED_POKE | RingFlags::ERROR));
        ring.clear_flags(RingFlags::NEED_POKE);
        assert_eq!(ring.flags(), RingFlags::ERROR);
    }

    #[test]
    fn test_ring_info_offsets() {
        let ring = Ring::allocate(16, 8, 8).unwrap();
        let info = ring.info();
        assert!(info.validate_header().is_ok());
        assert_eq!(info.size, 8);
        assert_eq!(info.element_stride, 16);
        assert_eq!(info.descriptors_offset, 64);

        ring.commit_producer(5);
        let producer = unsafe {
            ring.as_ptr()
                .add(info.producer_index_offset as usize)
                .cast::<u32>()
                .read()
        };
        assert_eq!(producer, 5);
    }

    #[test]
    fn test_multi_producer_preserves_count() {
        let ring = Ring::allocate(8, 1024, 8).unwrap();
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let ring = &ring;
                s.spawn(move || {
                    let mut written = 0u32;
                    while written < 200 {
                        if let Some((start, count)) = ring.reserve_producer_mp(200 - written) {
                            for i in 0..count {
                                unsafe { ring.write::<u64>(start.wrapping_add(i), t) };
                            }
                            ring.commit_producer_mp(start, count);
                            written += count;
                        }
                    }
                });
            }
        });

        assert_eq!(ring.used_count(), 800);
        let mut per_thread = [0u32; 4];
        for i in 0..800 {
            let value: u64 = unsafe { ring.read(i) };
            per_thread[value as usize] += 1;
        }
        assert_eq!(per_thread, [200; 4]);
    }

    #[test]
    fn test_mp_reserve_full() {
        let ring = Ring::allocate(8, 2, 8).unwrap();
        assert_eq!(ring.reserve_producer_mp(5), Some((0, 2)));
        assert_eq!(ring.reserve_producer_mp(1), None);
        ring.commit_producer_mp(0, 2);
        ring.release_consumer(1);
        assert_eq!(ring.reserve_producer_mp(4), Some((2, 1)));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_slots_survive_index_wrap(
                start in any::<u32>(),
                values in proptest::collection::vec(any::<u64>(), 1..16),
            ) {
                let ring = Ring::allocate(8, 16, 8).unwrap();
                ring.set_producer_index(start);
                ring.set_consumer_index(start);

                let count = ring.reserve_producer(values.len() as u32);
                prop_assert_eq!(count as usize, values.len());
                for (i, value) in values.iter().enumerate() {
                    unsafe { ring.write(start.wrapping_add(i as u32), *value) };
                }
                ring.commit_producer(count);

                prop_assert_eq!(ring.peek_consumer(u32::MAX), count);
                for (i, value) in values.iter().enumerate() {
                    let read: u64 = unsafe { ring.read(start.wrapping_add(i as u32)) };
                    prop_assert_eq!(read, *value);
                }
                ring.release_consumer(count);
                prop_assert_eq!(ring.used_count(), 0);
            }
        }
    }
}
