//! SLUICE core data model.
//!
//! The types every queue and socket shares:
//!
//! - [`ring::Ring`]: lock-free fixed-stride circular queue with acquire/release
//!   cursors, used for every frame, fragment, descriptor and completion queue.
//! - [`extension::ExtensionSet`]: versioned optional fields appended to frame
//!   and buffer records, packed by alignment.
//! - [`frame`]: the frame and buffer records, the well-known extensions, and a
//!   view for walking a frame's buffers.
//! - [`header::ObjectHeader`]: `{revision, size}` prefix of control structures.

pub mod error;
pub mod extension;
pub mod frame;
pub mod header;
pub mod ring;

pub use error::{CoreError, ErrorKind, Result};
pub use extension::{
    Extension, ExtensionInfo, ExtensionRegistration, ExtensionSet, ExtensionType,
};
pub use frame::{Buffer, Frame, FrameAccess, FrameBuffers, RxAction};
pub use header::{ObjectHeader, Versioned};
pub use ring::{Ring, RingFlags, RingInfo};

/// Record layout of a queue: frame ring, optional fragment ring, and the
/// extension sets they were laid out from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// Size of a buffer record with extensions
    pub buffer_size: u32,
    /// Alignment of a buffer record
    pub buffer_alignment: u8,
    /// Size of a frame record with extensions
    pub frame_size: u32,
    /// Alignment of a frame record
    pub frame_alignment: u8,
}

impl RecordLayout {
    /// Lay out buffer and frame records from their extension sets
    pub fn assign(buffers: &mut ExtensionSet, frames: &mut ExtensionSet) -> Result<Self> {
        let (buffer_size, buffer_alignment) =
            buffers.assign_layout(frame::BUFFER_SIZE, frame::BUFFER_ALIGNMENT)?;
        let (frame_size, frame_alignment) =
            frames.assign_layout(buffer_size, frame::FRAME_ALIGNMENT.max(buffer_alignment))?;
        Ok(Self {
            buffer_size,
            buffer_alignment,
            frame_size,
            frame_alignment,
        })
    }

    /// Allocate the frame ring and, when `max_fragments > 0`, the fragment ring
    pub fn allocate_rings(
        &self,
        ring_size: u32,
        max_fragments: u32,
    ) -> Result<(Ring, Option<Ring>)> {
        let frame_ring = Ring::allocate(self.frame_size, ring_size, self.frame_alignment)?;
        let fragment_ring = if max_fragments > 0 {
            Some(Ring::allocate(
                self.buffer_size,
                max_fragments.max(ring_size),
                self.buffer_alignment,
            )?)
        } else {
            None
        };
        Ok((frame_ring, fragment_ring))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::*;

    #[test]
    fn test_rx_record_layout() {
        let mut buffers = ExtensionSet::new(ExtensionType::Buffer, &RX_BUFFER_EXTENSIONS).unwrap();
        let mut frames = ExtensionSet::new(ExtensionType::Frame, &RX_FRAME_EXTENSIONS).unwrap();
        buffers.register_version(&BUFFER_VIRTUAL_ADDRESS).unwrap();
        buffers.enable(BUFFER_VIRTUAL_ADDRESS.name).unwrap();
        frames.register_version(&FRAME_RX_ACTION).unwrap();
        frames.enable(FRAME_RX_ACTION.name).unwrap();
        frames.register_version(&FRAME_FRAGMENT).unwrap();
        frames.enable(FRAME_FRAGMENT.name).unwrap();

        let layout = RecordLayout::assign(&mut buffers, &mut frames).unwrap();
        assert_eq!(layout.buffer_size, 24);
        assert_eq!(layout.buffer_alignment, 8);
        assert_eq!(layout.frame_size, 32);
        assert_eq!(layout.frame_alignment, 8);

        let (frame_ring, fragment_ring) = layout.allocate_rings(32, 4).unwrap();
        assert_eq!(frame_ring.capacity(), 32);
        assert_eq!(fragment_ring.unwrap().capacity(), 32);

        let (_, none) = layout.allocate_rings(32, 0).unwrap();
        assert!(none.is_none());
    }
}
