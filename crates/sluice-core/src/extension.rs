//! Extension sets: optional, versioned fields appended to frame and buffer
//! records.
//!
//! A queue reserves every extension it knows about when it creates a set.
//! The interface then declares which ones it provides, the queue enables the
//! ones it needs, and [`ExtensionSet::assign_layout`] packs the enabled
//! entries behind the fixed record. Offsets never change after assignment.

use crate::error::{CoreError, Result};
use serde::Serialize;
use std::ptr::NonNull;

/// Record type an extension is appended to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionType {
    /// Appended to a frame record
    Frame,
    /// Appended to a buffer record
    Buffer,
    /// Appended to a TX frame completion record
    TxFrameCompletion,
}

/// Identity of an extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtensionInfo {
    /// Well-known name
    pub name: &'static str,
    /// Version, starting at 1
    pub version: u32,
    /// Record type
    pub extension_type: ExtensionType,
}

impl ExtensionInfo {
    /// Build an extension identity
    pub const fn new(name: &'static str, version: u32, extension_type: ExtensionType) -> Self {
        Self {
            name,
            version,
            extension_type,
        }
    }
}

/// Reservation of an extension in a set, with its default size
#[derive(Debug, Clone, Copy)]
pub struct ExtensionRegistration {
    /// Extension identity
    pub info: ExtensionInfo,
    /// Default size in bytes
    pub size: u8,
    /// Default alignment, a power of two
    pub alignment: u8,
}

impl ExtensionRegistration {
    /// Reservation sized and aligned for `T`
    pub const fn of<T>(info: ExtensionInfo) -> Self {
        Self {
            info,
            size: std::mem::size_of::<T>() as u8,
            alignment: std::mem::align_of::<T>() as u8,
        }
    }

    /// Zero-sized reservation, sized later with [`ExtensionSet::resize`]
    pub const fn sized_later(info: ExtensionInfo) -> Self {
        Self {
            info,
            size: 0,
            alignment: 1,
        }
    }
}

/// Resolved location of an extension inside a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extension {
    offset: u16,
}

impl Extension {
    /// Byte offset from the start of the record
    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Pointer to this extension's field inside `record`.
    ///
    /// # Safety
    ///
    /// `record` must point to a record laid out by the set that resolved this
    /// extension, and `T` must be the extension's field type.
    pub unsafe fn field<T>(&self, record: NonNull<u8>) -> NonNull<T> {
        // SAFETY: the offset was assigned inside the record's layout.
        unsafe { record.add(self.offset as usize).cast::<T>() }
    }
}

/// Largest alignment an extension may request
pub const MAX_EXTENSION_ALIGNMENT: u8 = 64;

#[derive(Debug, Clone)]
struct Entry {
    info: ExtensionInfo,
    size: u8,
    alignment: u8,
    enabled: bool,
    interface_registered: bool,
    internal: bool,
    assigned: bool,
    assigned_offset: u16,
}

/// Fixed set of reserved extensions for one record type
#[derive(Debug, Clone)]
pub struct ExtensionSet {
    extension_type: ExtensionType,
    entries: Vec<Entry>,
}

impl ExtensionSet {
    /// Create a set reserving `reserved` extensions, all disabled
    pub fn new(extension_type: ExtensionType, reserved: &[ExtensionRegistration]) -> Result<Self> {
        let mut entries = Vec::with_capacity(reserved.len());
        for registration in reserved {
            validate_info(extension_type, &registration.info)?;
            validate_alignment(registration.alignment)?;
            entries.push(Entry {
                info: registration.info,
                size: registration.size,
                alignment: registration.alignment,
                enabled: false,
                interface_registered: false,
                internal: false,
                assigned: false,
                assigned_offset: 0,
            });
        }

        Ok(Self {
            extension_type,
            entries,
        })
    }

    /// Record type of this set
    pub fn extension_type(&self) -> ExtensionType {
        self.extension_type
    }

    fn entry(&self, name: &str) -> Result<&Entry> {
        self.entries
            .iter()
            .find(|e| e.info.name == name)
            .ok_or_else(|| CoreError::ExtensionNotFound(name.to_string()))
    }

    fn entry_mut(&mut self, name: &str) -> Result<&mut Entry> {
        self.entries
            .iter_mut()
            .find(|e| e.info.name == name)
            .ok_or_else(|| CoreError::ExtensionNotFound(name.to_string()))
    }

    /// Provider declares support for an extension. Only the reserved version
    /// is accepted.
    pub fn register_version(&mut self, info: &ExtensionInfo) -> Result<()> {
        validate_info(self.extension_type, info)?;
        let entry = self.entry_mut(info.name)?;
        if entry.info.version != info.version {
            return Err(CoreError::ExtensionVersionMismatch {
                name: info.name.to_string(),
                reserved: entry.info.version,
                registered: info.version,
            });
        }
        entry.interface_registered = true;
        Ok(())
    }

    /// Enable an extension for layout
    pub fn enable(&mut self, name: &str) -> Result<()> {
        self.entry_mut(name)?.enabled = true;
        Ok(())
    }

    /// Mark an extension usable without a provider declaration
    pub fn set_internal(&mut self, name: &str) -> Result<()> {
        self.entry_mut(name)?.internal = true;
        Ok(())
    }

    /// Change the size and alignment of a reserved extension
    pub fn resize(&mut self, name: &str, size: u8, alignment: u8) -> Result<()> {
        validate_alignment(alignment)?;
        let entry = self.entry_mut(name)?;
        entry.size = size;
        entry.alignment = alignment;
        Ok(())
    }

    /// Whether an extension is enabled
    pub fn is_enabled(&self, name: &str) -> Result<bool> {
        Ok(self.entry(name)?.enabled)
    }

    /// Pack enabled extensions behind a record starting at `base_offset`
    /// with alignment `base_alignment`.
    ///
    /// Entries are placed by descending alignment in two passes: first those
    /// that fit the alignment already implied by the running offset, then the
    /// rest with explicit padding. Returns the padded record size and its
    /// alignment.
    pub fn assign_layout(&mut self, base_offset: u32, base_alignment: u8) -> Result<(u32, u8)> {
        let mut offset = base_offset;
        let mut max_alignment = base_alignment;
        let mut current_alignment: u32 = if offset > 0 {
            1 << offset.trailing_zeros()
        } else {
            0x80
        };

        self.entries
            .sort_by(|a, b| b.alignment.cmp(&a.alignment));

        for pass in 0..2 {
            for entry in self.entries.iter_mut() {
                if !entry.enabled || entry.assigned {
                    continue;
                }
                if !entry.internal && !entry.interface_registered {
                    return Err(CoreError::InvalidParameter(format!(
                        "extension {} enabled without provider registration",
                        entry.info.name
                    )));
                }

                if pass == 1 {
                    offset = crate::ring::align_up_u32(offset, entry.alignment as u32)
                        .ok_or(CoreError::IntegerOverflow("extension offset"))?;
                } else if current_alignment < entry.alignment as u32 {
                    continue;
                }

                if offset > u16::MAX as u32 {
                    return Err(CoreError::IntegerOverflow("extension offset"));
                }

                max_alignment = max_alignment.max(entry.alignment);
                entry.assigned_offset = offset as u16;
                entry.assigned = true;

                let padded = crate::ring::align_up_u32(entry.size as u32, entry.alignment as u32)
                    .ok_or(CoreError::IntegerOverflow("extension size"))?;
                offset += padded;
                current_alignment = entry.alignment as u32;
            }
        }

        let size = crate::ring::align_up_u32(offset, max_alignment as u32)
            .ok_or(CoreError::IntegerOverflow("record size"))?;

        tracing::trace!(
            extension_type = ?self.extension_type,
            size,
            alignment = max_alignment,
            "assigned extension layout"
        );

        Ok((size, max_alignment))
    }

    /// Resolve an enabled, assigned extension
    pub fn get_extension(&self, info: &ExtensionInfo) -> Result<Extension> {
        validate_info(self.extension_type, info)?;
        let entry = self.entry(info.name)?;
        if !entry.enabled || !entry.assigned {
            return Err(CoreError::ExtensionUnassigned(info.name.to_string()));
        }
        if entry.info.version < info.version {
            return Err(CoreError::ExtensionVersionMismatch {
                name: info.name.to_string(),
                reserved: entry.info.version,
                registered: info.version,
            });
        }
        Ok(Extension {
            offset: entry.assigned_offset,
        })
    }

    /// Offsets and sizes of all assigned extensions
    pub fn assigned(&self) -> impl Iterator<Item = (&'static str, u16, u8, u8)> + '_ {
        self.entries
            .iter()
            .filter(|e| e.assigned)
            .map(|e| (e.info.name, e.assigned_offset, e.size, e.alignment))
    }
}

fn validate_info(extension_type: ExtensionType, info: &ExtensionInfo) -> Result<()> {
    if info.extension_type != extension_type {
        return Err(CoreError::InvalidParameter(format!(
            "extension {} has type {:?}, set holds {:?}",
            info.name, info.extension_type, extension_type
        )));
    }
    if info.name.is_empty() || info.version == 0 {
        return Err(CoreError::InvalidParameter(
            "extension needs a name and a non-zero version".into(),
        ));
    }
    Ok(())
}

fn validate_alignment(alignment: u8) -> Result<()> {
    if alignment == 0 || !alignment.is_power_of_two() || alignment > MAX_EXTENSION_ALIGNMENT {
        return Err(CoreError::InvalidParameter(format!(
            "extension alignment {alignment} must be a power of two <= {MAX_EXTENSION_ALIGNMENT}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ExtensionInfo = ExtensionInfo::new("test.a", 1, ExtensionType::Buffer);
    const B: ExtensionInfo = ExtensionInfo::new("test.b", 1, ExtensionType::Buffer);
    const C: ExtensionInfo = ExtensionInfo::new("test.c", 2, ExtensionType::Buffer);

    fn sample_set() -> ExtensionSet {
        ExtensionSet::new(
            ExtensionType::Buffer,
            &[
                ExtensionRegistration {
                    info: A,
                    size: 1,
                    alignment: 1,
                },
                ExtensionRegistration {
                    info: B,
                    size: 8,
                    alignment: 8,
                },
                ExtensionRegistration {
                    info: C,
                    size: 4,
                    alignment: 4,
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_layout_fills_implied_alignment_first() {
        let mut set = sample_set();
        for info in [A, B, C] {
            set.register_version(&info).unwrap();
            set.enable(info.name).unwrap();
        }

        // Base offset 20 implies 4-byte alignment: C fits first, then A, then B padded.
        let (size, alignment) = set.assign_layout(20, 4).unwrap();
        assert_eq!(set.get_extension(&C).unwrap().offset(), 20);
        assert_eq!(set.get_extension(&A).unwrap().offset(), 24);
        assert_eq!(set.get_extension(&B).unwrap().offset(), 32);
        assert_eq!(alignment, 8);
        assert_eq!(size, 40);
    }

    #[test]
    fn test_layout_zero_base_is_unconstrained() {
        let mut set = sample_set();
        for info in [A, B, C] {
            set.set_internal(info.name).unwrap();
            set.enable(info.name).unwrap();
        }
        let (size, alignment) = set.assign_layout(0, 1).unwrap();
        assert_eq!(set.get_extension(&B).unwrap().offset(), 0);
        assert_eq!(set.get_extension(&C).unwrap().offset(), 8);
        assert_eq!(set.get_extension(&A).unwrap().offset(), 12);
        assert_eq!((size, alignment), (16, 8));
    }

    #[test]
    fn test_disabled_extensions_take_no_space() {
        let mut set = sample_set();
        set.register_version(&A).unwrap();
        set.enable(A.name).unwrap();
        let (size, alignment) = set.assign_layout(16, 4).unwrap();
        assert_eq!((size, alignment), (20, 4));
        assert!(set.get_extension(&B).is_err());
        assert!(!set.is_enabled(B.name).unwrap());
    }

    #[test]
    fn test_version_mismatch_is_fatal() {
        let mut set = sample_set();
        let wrong = ExtensionInfo::new("test.a", 2, ExtensionType::Buffer);
        let err = set.register_version(&wrong).unwrap_err();
        assert!(matches!(err, CoreError::ExtensionVersionMismatch { .. }));
    }

    #[test]
    fn test_get_extension_accepts_older_request() {
        let mut set = sample_set();
        set.register_version(&C).unwrap();
        set.enable(C.name).unwrap();
        set.assign_layout(0, 1).unwrap();
        let older = ExtensionInfo::new("test.c", 1, ExtensionType::Buffer);
        assert!(set.get_extension(&older).is_ok());
        let newer = ExtensionInfo::new("test.c", 3, ExtensionType::Buffer);
        assert!(set.get_extension(&newer).is_err());
    }

    #[test]
    fn test_get_before_assign_fails() {
        let mut set = sample_set();
        set.register_version(&A).unwrap();
        set.enable(A.name).unwrap();
        let err = set.get_extension(&A).unwrap_err();
        assert!(matches!(err, CoreError::ExtensionUnassigned(_)));
    }

    #[test]
    fn test_enabled_without_registration_rejected() {
        let mut set = sample_set();
        set.enable(A.name).unwrap();
        assert!(set.assign_layout(0, 1).is_err());
    }

    #[test]
    fn test_resize_validates_alignment() {
        let mut set = sample_set();
        assert!(set.resize(A.name, 16, 3).is_err());
        assert!(set.resize(A.name, 16, 128).is_err());
        set.resize(A.name, 16, 16).unwrap();
        set.set_internal(A.name).unwrap();
        set.enable(A.name).unwrap();
        let (size, alignment) = set.assign_layout(0, 1).unwrap();
        assert_eq!((size, alignment), (16, 16));
    }

    #[test]
    fn test_offset_overflow() {
        let mut set = sample_set();
        set.set_internal(A.name).unwrap();
        set.enable(A.name).unwrap();
        let err = set.assign_layout(u16::MAX as u32 + 1, 1).unwrap_err();
        assert!(matches!(err, CoreError::IntegerOverflow(_)));
    }

    #[test]
    fn test_unknown_name() {
        let mut set = sample_set();
        assert!(set.enable("test.missing").is_err());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let mut set = sample_set();
        let frame_info = ExtensionInfo::new("test.a", 1, ExtensionType::Frame);
        assert!(set.register_version(&frame_info).is_err());
    }
}
