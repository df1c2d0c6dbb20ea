//! Versioned `{revision, size}` header carried by every control structure.
//!
//! A consumer compares the header against the revision it was built for and
//! the minimum structure size of that revision. Newer revisions may grow the
//! structure; older or truncated ones are rejected.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Header prefix of a control-path structure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(C)]
pub struct ObjectHeader {
    /// Structure revision
    pub revision: u8,
    /// Size of the structure in bytes, as written by the producer
    pub size: u16,
}

impl ObjectHeader {
    /// Build a header
    pub const fn new(revision: u8, size: u16) -> Self {
        Self { revision, size }
    }

    /// Check the header against an expected revision and its minimum size
    pub fn check(&self, expected_revision: u8, minimum_size: u16) -> Result<()> {
        if self.revision < expected_revision {
            return Err(CoreError::Header(format!(
                "revision {} older than required {}",
                self.revision, expected_revision
            )));
        }
        if self.size < minimum_size {
            return Err(CoreError::Header(format!(
                "size {} below minimum {} for revision {}",
                self.size, minimum_size, expected_revision
            )));
        }
        Ok(())
    }
}

/// A control structure that carries an [`ObjectHeader`]
pub trait Versioned {
    /// Current revision
    const REVISION: u8;
    /// Minimum size of [`Self::REVISION`]
    const REVISION_SIZE: u16;

    /// The structure's header
    fn header(&self) -> &ObjectHeader;

    /// Header for a freshly built structure of the current revision
    fn current_header() -> ObjectHeader {
        ObjectHeader::new(Self::REVISION, Self::REVISION_SIZE)
    }

    /// Reject the structure if its header is older or smaller than expected
    fn validate_header(&self) -> Result<()> {
        self.header().check(Self::REVISION, Self::REVISION_SIZE)
    }
}

/// Size of `T` as a header size field
pub const fn size_of_u16<T>() -> u16 {
    let size = std::mem::size_of::<T>();
    assert!(size <= u16::MAX as usize);
    size as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_accepts_current() {
        let header = ObjectHeader::new(1, 24);
        assert!(header.check(1, 24).is_ok());
        assert!(header.check(1, 16).is_ok());
    }

    #[test]
    fn test_header_rejects_small_size() {
        let header = ObjectHeader::new(1, 8);
        let err = header.check(1, 24).unwrap_err();
        assert!(err.to_string().contains("below minimum"));
    }

    #[test]
    fn test_header_rejects_old_revision() {
        let header = ObjectHeader::new(1, 64);
        assert!(header.check(2, 24).is_err());
    }

    #[test]
    fn test_header_newer_revision_accepted() {
        let header = ObjectHeader::new(3, 64);
        assert!(header.check(1, 24).is_ok());
    }
}
