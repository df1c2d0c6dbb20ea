//! Frame and buffer records.
//!
//! A frame is one inline [`Buffer`] followed by the frame extensions the
//! queue enabled. Frames with more than one buffer keep the remaining buffers
//! contiguously in a parallel fragment ring; the frame's fragment extension
//! holds the count. The fragment cursor handed to inspection points at the
//! frame's first fragment, and walking starts from that cursor minus one so
//! the first increment lands on it.

use crate::extension::{Extension, ExtensionInfo, ExtensionRegistration, ExtensionType};
use crate::ring::Ring;
use serde::{Deserialize, Serialize};
use std::ptr::NonNull;

/// Contiguous data region backing part of a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Buffer {
    /// Offset of the first data byte from the buffer start
    pub data_offset: u32,
    /// Number of data bytes
    pub data_length: u32,
    /// Total length of the buffer, including `data_offset`
    pub buffer_length: u32,
    /// Reserved, zero
    pub reserved: u32,
}

/// Frame record prefix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Frame {
    /// First buffer of the frame
    pub buffer: Buffer,
}

/// Number of buffers stored in the fragment ring for a frame
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct FrameFragment {
    /// Fragment count, excluding the inline buffer
    pub fragment_buffer_count: u8,
}

/// Action chosen for a received frame
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct FrameRxAction {
    /// [`RxAction`] as a byte
    pub rx_action: u8,
}

/// Completion owner of a TX frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TxCompletionContext {
    /// Client token of the frame's producer
    pub context: u64,
}

/// Element of a TX completion ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TxFrameCompletion {
    /// Address of the completed buffer, in the addressing mode of the queue
    pub buffer_address: u64,
}

/// Process virtual address of a buffer
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct BufferVirtualAddress {
    /// Start of the buffer (before `data_offset`)
    pub virtual_address: *mut u8,
}

/// Device-visible address of a buffer
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct BufferLogicalAddress {
    /// Start of the buffer in device address space
    pub logical_address: u64,
}

/// Memory-region descriptor of a buffer
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct BufferMdl {
    /// Opaque identifier of the backing region
    pub mdl: u64,
    /// Offset of the buffer inside the region
    pub mdl_offset: u64,
}

/// Verdict recorded on a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RxAction {
    /// Discard the frame
    Drop = 0,
    /// Deliver the frame to the regular stack
    #[default]
    Pass = 1,
    /// Transmit the frame back out of the interface
    Tx = 2,
}

impl RxAction {
    /// Decode a stored action, treating unknown values as drop
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => RxAction::Pass,
            2 => RxAction::Tx,
            _ => RxAction::Drop,
        }
    }
}

/// Size of the fixed buffer record
pub const BUFFER_SIZE: u32 = std::mem::size_of::<Buffer>() as u32;
/// Alignment of the fixed buffer record
pub const BUFFER_ALIGNMENT: u8 = std::mem::align_of::<Buffer>() as u8;
/// Alignment of the fixed frame record
pub const FRAME_ALIGNMENT: u8 = std::mem::align_of::<Frame>() as u8;

/// Fragment count extension
pub const FRAME_FRAGMENT: ExtensionInfo =
    ExtensionInfo::new("sluice.frame.fragment", 1, ExtensionType::Frame);
/// RX action extension
pub const FRAME_RX_ACTION: ExtensionInfo =
    ExtensionInfo::new("sluice.frame.rx_action", 1, ExtensionType::Frame);
/// Interface-private frame context
pub const FRAME_INTERFACE_CONTEXT: ExtensionInfo =
    ExtensionInfo::new("sluice.frame.interface_context", 1, ExtensionType::Frame);
/// TX completion context on a frame
pub const FRAME_TX_COMPLETION_CONTEXT: ExtensionInfo =
    ExtensionInfo::new("sluice.tx.completion_context", 1, ExtensionType::Frame);
/// TX completion context on a completion record
pub const TX_COMPLETION_CONTEXT: ExtensionInfo = ExtensionInfo::new(
    "sluice.tx.completion_context",
    1,
    ExtensionType::TxFrameCompletion,
);
/// Buffer virtual address extension
pub const BUFFER_VIRTUAL_ADDRESS: ExtensionInfo =
    ExtensionInfo::new("sluice.buffer.virtual_address", 1, ExtensionType::Buffer);
/// Buffer logical address extension
pub const BUFFER_LOGICAL_ADDRESS: ExtensionInfo =
    ExtensionInfo::new("sluice.buffer.logical_address", 1, ExtensionType::Buffer);
/// Buffer memory-region extension
pub const BUFFER_MDL: ExtensionInfo =
    ExtensionInfo::new("sluice.buffer.mdl", 1, ExtensionType::Buffer);
/// Interface-private buffer context
pub const BUFFER_INTERFACE_CONTEXT: ExtensionInfo =
    ExtensionInfo::new("sluice.buffer.interface_context", 1, ExtensionType::Buffer);

/// Frame extensions reserved by RX queues
pub const RX_FRAME_EXTENSIONS: [ExtensionRegistration; 3] = [
    ExtensionRegistration::of::<FrameFragment>(FRAME_FRAGMENT),
    ExtensionRegistration::of::<FrameRxAction>(FRAME_RX_ACTION),
    ExtensionRegistration::sized_later(FRAME_INTERFACE_CONTEXT),
];

/// Buffer extensions reserved by RX queues
pub const RX_BUFFER_EXTENSIONS: [ExtensionRegistration; 2] = [
    ExtensionRegistration::of::<BufferVirtualAddress>(BUFFER_VIRTUAL_ADDRESS),
    ExtensionRegistration::sized_later(BUFFER_INTERFACE_CONTEXT),
];

/// Frame extensions reserved by TX queues
pub const TX_FRAME_EXTENSIONS: [ExtensionRegistration; 2] = [
    ExtensionRegistration::of::<TxCompletionContext>(FRAME_TX_COMPLETION_CONTEXT),
    ExtensionRegistration::sized_later(FRAME_INTERFACE_CONTEXT),
];

/// Buffer extensions reserved by TX queues
pub const TX_BUFFER_EXTENSIONS: [ExtensionRegistration; 4] = [
    ExtensionRegistration::of::<BufferVirtualAddress>(BUFFER_VIRTUAL_ADDRESS),
    ExtensionRegistration::of::<BufferLogicalAddress>(BUFFER_LOGICAL_ADDRESS),
    ExtensionRegistration::of::<BufferMdl>(BUFFER_MDL),
    ExtensionRegistration::sized_later(BUFFER_INTERFACE_CONTEXT),
];

/// Completion extensions reserved by TX queues
pub const TX_COMPLETION_EXTENSIONS: [ExtensionRegistration; 1] =
    [ExtensionRegistration::of::<TxCompletionContext>(TX_COMPLETION_CONTEXT)];

/// Extensions needed to walk the buffers of a frame
#[derive(Debug, Clone, Copy)]
pub struct FrameAccess {
    /// Buffer virtual address extension
    pub virtual_address: Extension,
    /// Frame fragment extension, when the queue has a fragment ring
    pub fragment: Option<Extension>,
}

/// Borrowed view over the buffers of one frame
pub struct FrameBuffers<'a> {
    frame: NonNull<u8>,
    fragment_ring: Option<&'a Ring>,
    fragment_index: u32,
    access: FrameAccess,
}

impl<'a> FrameBuffers<'a> {
    /// Build a view over the frame record at `frame`.
    ///
    /// # Safety
    ///
    /// `frame` must point to a frame record laid out with `access`, owned by
    /// the caller for `'a`. Every buffer's virtual address must be valid for
    /// `buffer_length` bytes for `'a`, and no other party may access that
    /// memory meanwhile. `fragment_index` must be the frame's first fragment
    /// slot when the frame has fragments.
    pub unsafe fn new(
        frame: NonNull<u8>,
        fragment_ring: Option<&'a Ring>,
        fragment_index: u32,
        access: FrameAccess,
    ) -> Self {
        Self {
            frame,
            fragment_ring,
            fragment_index,
            access,
        }
    }

    /// Number of buffers held in the fragment ring
    pub fn fragment_count(&self) -> u32 {
        match (self.fragment_ring, self.access.fragment) {
            (Some(_), Some(ext)) => {
                // SAFETY: the frame layout includes the fragment extension.
                unsafe { ext.field::<FrameFragment>(self.frame).as_ref() }.fragment_buffer_count
                    as u32
            }
            _ => 0,
        }
    }

    /// Number of buffers, including the inline one
    pub fn buffer_count(&self) -> u32 {
        1 + self.fragment_count()
    }

    fn buffer_ptr(&self, index: u32) -> NonNull<u8> {
        match (index, self.fragment_ring) {
            (0, _) | (_, None) => self.frame,
            (_, Some(ring)) => {
                // Biased cursor: fragment_index - 1 + 1 is the first fragment.
                let slot = self.fragment_index.wrapping_sub(1).wrapping_add(index);
                ring.element(slot)
            }
        }
    }

    /// Copy of the buffer record at `index` (0 is the inline buffer)
    pub fn buffer(&self, index: u32) -> Buffer {
        // SAFETY: buffer_ptr points to a buffer record owned for 'a.
        unsafe { self.buffer_ptr(index).cast::<Buffer>().read() }
    }

    fn data_ptr(&self, index: u32) -> Option<(NonNull<u8>, usize)> {
        let record = self.buffer_ptr(index);
        // SAFETY: the record layout includes the virtual address extension.
        let va = unsafe {
            self.access
                .virtual_address
                .field::<BufferVirtualAddress>(record)
                .read()
        }
        .virtual_address;
        let buffer = self.buffer(index);
        if buffer.data_length == 0 {
            return None;
        }
        let base = NonNull::new(va)?;
        // SAFETY: data_offset lies within the buffer per the record contract.
        let data = unsafe { base.add(buffer.data_offset as usize) };
        Some((data, buffer.data_length as usize))
    }

    /// Data bytes of buffer `index`
    pub fn data(&self, index: u32) -> &[u8] {
        match self.data_ptr(index) {
            // SAFETY: valid for 'a and not mutated elsewhere (constructor contract).
            Some((ptr, len)) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) },
            None => &[],
        }
    }

    /// Mutable data bytes of buffer `index`
    pub fn data_mut(&mut self, index: u32) -> &mut [u8] {
        match self.data_ptr(index) {
            // SAFETY: exclusive access for 'a (constructor contract) and &mut self.
            Some((ptr, len)) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) },
            None => &mut [],
        }
    }

    /// Total data bytes across all buffers
    pub fn total_length(&self) -> usize {
        (0..self.buffer_count())
            .map(|i| self.buffer(i).data_length as usize)
            .sum()
    }

    /// Copy frame bytes starting at logical `offset` into `dst`. Returns the
    /// number of bytes copied.
    pub fn read_at(&self, mut offset: usize, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for index in 0..self.buffer_count() {
            if copied == dst.len() {
                break;
            }
            let data = self.data(index);
            if offset >= data.len() {
                offset -= data.len();
                continue;
            }
            let n = (data.len() - offset).min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&data[offset..offset + n]);
            copied += n;
            offset = 0;
        }
        copied
    }

    /// Copy `src` into the frame starting at logical `offset`. Returns the
    /// number of bytes written.
    pub fn write_at(&mut self, mut offset: usize, src: &[u8]) -> usize {
        let mut written = 0;
        for index in 0..self.buffer_count() {
            if written == src.len() {
                break;
            }
            let data = self.data_mut(index);
            if offset >= data.len() {
                offset -= data.len();
                continue;
            }
            let n = (data.len() - offset).min(src.len() - written);
            data[offset..offset + n].copy_from_slice(&src[written..written + n]);
            written += n;
            offset = 0;
        }
        written
    }
}
