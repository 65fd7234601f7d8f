//! Fixed-size variable records stored in the segment

use crate::error::{ShmError, ShmResult};
use crate::types::TypeTag;
use bitflags::bitflags;
use serde::Serialize;
use shvar::consts::{MAX_DESCRIPTION_LEN, MAX_NAME_LEN};
use static_assertions::{const_assert, const_assert_eq};
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, Ordering};

/// Variable name as stored in handles and snapshots
pub type VarName = heapless::String<MAX_NAME_LEN>;

/// Variable description as stored in snapshots
pub type VarDescription = heapless::String<MAX_DESCRIPTION_LEN>;

bitflags! {
    /// Per-record flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u8 {
        /// Survives its reference count reaching zero
        const PERSISTENT = 1 << 0;
    }
}

/// One named variable: identity, payload location and attachment count
///
/// Records move when the store inserts, removes or grows, so nothing may keep
/// a reference to one across a release of the registry lock.
#[repr(C)]
pub struct VarRecord {
    name: [u8; MAX_NAME_LEN],
    description: [u8; MAX_DESCRIPTION_LEN],
    name_len: u8,
    description_len: u8,
    flags: u8,
    _pad: u8,
    type_tag: TypeTag,
    offset: u64,
    size: u64,
    ref_count: AtomicU32,
    _reserved: u32,
}

const_assert_eq!(size_of::<VarRecord>(), 144);
const_assert_eq!(align_of::<VarRecord>(), 8);
const_assert!(MAX_NAME_LEN <= u8::MAX as usize);
const_assert!(MAX_DESCRIPTION_LEN <= u8::MAX as usize);

/// Check a variable name against the record limits.
pub fn validate_name(name: &str) -> ShmResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ShmError::InvalidName {
            name: name.to_string(),
            max: MAX_NAME_LEN,
        });
    }
    Ok(())
}

/// Check a description against the record limits.
pub fn validate_description(name: &str, description: &str) -> ShmResult<()> {
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(ShmError::DescriptionTooLong {
            name: name.to_string(),
            max: MAX_DESCRIPTION_LEN,
        });
    }
    Ok(())
}

pub(crate) fn bounded<const N: usize>(text: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    let _ = out.push_str(text);
    out
}

impl VarRecord {
    /// Build a record with one reference. Name and description must already
    /// be validated.
    pub(crate) fn new(
        name: &str,
        description: &str,
        type_tag: TypeTag,
        offset: u64,
        size: usize,
        persistent: bool,
    ) -> Self {
        let mut record = Self {
            name: [0; MAX_NAME_LEN],
            description: [0; MAX_DESCRIPTION_LEN],
            name_len: name.len() as u8,
            description_len: description.len() as u8,
            flags: 0,
            _pad: 0,
            type_tag,
            offset,
            size: size as u64,
            ref_count: AtomicU32::new(1),
            _reserved: 0,
        };
        record.name[..name.len()].copy_from_slice(name.as_bytes());
        record.description[..description.len()].copy_from_slice(description.as_bytes());
        record.set_persistent(persistent);
        record
    }

    /// Raw name bytes, the store's sort key
    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..(self.name_len as usize).min(MAX_NAME_LEN)]
    }

    pub fn name(&self) -> &str {
        std::str::from_utf8(self.name_bytes()).unwrap_or_default()
    }

    pub fn description(&self) -> &str {
        let len = (self.description_len as usize).min(MAX_DESCRIPTION_LEN);
        std::str::from_utf8(&self.description[..len]).unwrap_or_default()
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Segment-relative payload offset
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size as usize
    }

    pub fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits_truncate(self.flags)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags().contains(RecordFlags::PERSISTENT)
    }

    pub(crate) fn set_persistent(&mut self, persistent: bool) {
        let mut flags = self.flags();
        flags.set(RecordFlags::PERSISTENT, persistent);
        self.flags = flags.bits();
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add one attachment, returning the new count.
    pub(crate) fn acquire(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one attachment, returning the new count. `None` when the count was
    /// already zero.
    pub(crate) fn release(&self) -> Option<u32> {
        self.ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
            .map(|previous| previous - 1)
    }

    /// Copy of the record's metadata
    pub fn info(&self) -> VarInfo {
        VarInfo {
            name: bounded(self.name()),
            description: bounded(self.description()),
            type_tag: self.type_tag,
            offset: self.offset,
            size: self.size(),
            persistent: self.is_persistent(),
            ref_count: self.ref_count(),
        }
    }
}

/// Snapshot of a variable record, detached from the segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VarInfo {
    pub name: VarName,
    pub description: VarDescription,
    pub type_tag: TypeTag,
    /// Segment-relative payload offset
    pub offset: u64,
    pub size: usize,
    pub persistent: bool,
    /// Attachment count when the snapshot was taken
    pub ref_count: u32,
}
