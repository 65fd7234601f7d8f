//! Process-wide manager of named variables in one shared segment
//!
//! # Locking
//!
//! Two locks live in the segment header:
//!
//! - the creation lock serializes the check-then-create sequence so that at
//!   most one process creates a given name;
//! - the registry lock guards the record store and the heap. Lookups and
//!   reference-count changes take it shared, anything that inserts, erases,
//!   moves records or touches the heap takes it exclusive.
//!
//! The creation lock is always taken first. Shared and exclusive acquisitions
//! of the registry lock are never nested.
//!
//! Reference counts are atomics inside the records, so attaching and
//! releasing only need the shared lock. Reclaiming a record after its count
//! reached zero re-checks the count under the exclusive lock; an attach that
//! slipped in between wins and the record stays.

use crate::error::{ShmError, ShmResult};
use crate::heap::{Heap, HeapStats};
use crate::placement::{Finalizer, PayloadLayout};
use crate::record::{VarInfo, VarRecord, validate_description, validate_name};
use crate::segment::SegmentMap;
use crate::types::{TypeTable, TypeTag};
use serde::Serialize;
use shvar::config::RegistryConfig;
use shvar::consts::ALLOC_ALIGN;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

/// Result of dropping one reference to a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other attachments remain
    StillReferenced(u32),
    /// Last attachment gone, record kept because it is persistent
    Retained,
    /// Last attachment gone, record erased and payload freed
    Reclaimed,
    /// Count reached zero but another attach arrived before reclamation
    Reattached,
    /// No such variable, or its count was already zero
    NotAttached,
}

/// One entry of [`Registry::list_all`]
#[derive(Debug, Clone)]
pub struct VarEntry {
    /// Record snapshot
    pub info: VarInfo,
    /// Payload address in this process
    pub address: NonNull<u8>,
}

/// Registry usage snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub segment_name: String,
    pub capacity: usize,
    pub owner: bool,
    pub creator_pid: u32,
    pub creator_alive: bool,
    pub created_ts: u64,
    pub records: usize,
    pub record_capacity: usize,
    pub persistent_records: usize,
    pub referenced_records: usize,
    pub heap: HeapStats,
}

/// Handle to the shared variable registry of one segment
///
/// Open it once per process and share the `Arc`; every [`SharedVar`](crate::SharedVar)
/// keeps the registry alive.
pub struct Registry {
    segment: SegmentMap,
    types: TypeTable,
}

// SAFETY: the raw mapping is only reached through the segment locks or through
// atomics inside records.
unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("segment", &self.segment.name())
            .field("path", &self.segment.path())
            .field("capacity", &self.segment.capacity())
            .field("owner", &self.segment.is_owner())
            .finish()
    }
}

impl Registry {
    /// Create or open the segment described by `config`, with the built-in
    /// type table.
    pub fn open(config: &RegistryConfig) -> ShmResult<Arc<Self>> {
        Self::open_with_types(config, TypeTable::with_builtins())
    }

    /// Create or open the segment with a caller-provided type table.
    pub fn open_with_types(config: &RegistryConfig, types: TypeTable) -> ShmResult<Arc<Self>> {
        config.validate()?;
        let segment = SegmentMap::open(config)?;
        Ok(Arc::new(Self { segment, types }))
    }

    /// Remove the backing object. Existing mappings stay valid; the next
    /// [`open`](Self::open) creates a fresh segment.
    pub fn unlink(config: &RegistryConfig) -> ShmResult<bool> {
        let removed = crate::platform::unlink_segment(&config.segment_path())?;
        if removed {
            tracing::info!("Unlinked segment '{}'", config.segment_name);
        }
        Ok(removed)
    }

    /// Whether this process created the segment
    pub fn is_owner(&self) -> bool {
        self.segment.is_owner()
    }

    pub fn segment_name(&self) -> &str {
        self.segment.name()
    }

    pub fn segment_path(&self) -> &Path {
        self.segment.path()
    }

    pub fn capacity(&self) -> usize {
        self.segment.capacity()
    }

    /// Base address of the mapping in this process
    pub fn base_address(&self) -> *const u8 {
        self.segment.base()
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Attach to an existing variable, validating tag and size.
    ///
    /// Returns the payload offset with the reference count already
    /// incremented, or `None` if no such variable exists.
    pub fn attach(&self, name: &str, type_tag: TypeTag, size: usize) -> ShmResult<Option<u64>> {
        let _read = self.segment.registry_lock().read()?;
        let store = self.segment.store();

        match store.get(name) {
            Some(record) => {
                check_layout(name, record, type_tag, size)?;
                let count = record.acquire();
                tracing::trace!("Attached '{}' (ref_count {})", name, count);
                Ok(Some(record.offset()))
            }
            None => Ok(None),
        }
    }

    /// Attach to `name`, creating it zero-filled if absent.
    ///
    /// Returns the payload offset and whether this call created it.
    pub fn create_or_attach(
        &self,
        name: &str,
        type_tag: TypeTag,
        size: usize,
        description: &str,
        persistent: bool,
    ) -> ShmResult<(u64, bool)> {
        let layout = PayloadLayout::bytes(type_tag, size)?;
        self.create_or_attach_with(name, description, &layout, persistent, |_| {})
    }

    /// Attach to `name`, creating it if absent. `init` runs on the zeroed
    /// payload before the record becomes visible to anyone else.
    pub(crate) fn create_or_attach_with<F>(
        &self,
        name: &str,
        description: &str,
        layout: &PayloadLayout,
        persistent: bool,
        init: F,
    ) -> ShmResult<(u64, bool)>
    where
        F: FnOnce(NonNull<u8>),
    {
        validate_name(name)?;
        validate_description(name, description)?;
        if layout.type_tag == 0 {
            return Err(ShmError::InvalidTypeTag { tag: 0 });
        }

        let _creation = self.segment.creation_lock().lock()?;

        if let Some(offset) = self.attach(name, layout.type_tag, layout.size)? {
            return Ok((offset, false));
        }

        let _write = self.segment.registry_lock().write()?;
        let store = self.segment.store();
        let heap = self.segment.heap();

        let idx = match store.find(name) {
            Ok(idx) => {
                let record = &store.records()[idx];
                check_layout(name, record, layout.type_tag, layout.size)?;
                record.acquire();
                return Ok((record.offset(), false));
            }
            Err(idx) => idx,
        };

        store.reserve_one(&heap)?;
        let pending = PendingPayload {
            heap: &heap,
            offset: heap.allocate(layout.size)?,
        };
        let offset = pending.offset;
        let payload = self.segment.ptr_at(offset, layout.size)?;
        check_alignment(payload, layout.align)?;

        unsafe { std::ptr::write_bytes(payload.as_ptr(), 0, layout.size) };
        init(payload);

        store.insert_at(
            idx,
            VarRecord::new(name, description, layout.type_tag, offset, layout.size, persistent),
        );
        std::mem::forget(pending);

        tracing::debug!(
            "Created '{}' (tag {}, {} bytes at {:#x}{})",
            name,
            layout.type_tag,
            layout.size,
            offset,
            if persistent { ", persistent" } else { "" }
        );
        Ok((offset, true))
    }

    /// Snapshot of the record for `name`
    pub fn exists(&self, name: &str) -> ShmResult<Option<VarInfo>> {
        let _read = self.segment.registry_lock().read()?;
        Ok(self.segment.store().get(name).map(VarRecord::info))
    }

    /// Drop one reference to `name`; reclaim it if that was the last one and
    /// it is not persistent.
    pub fn release(&self, name: &str) -> ShmResult<ReleaseOutcome> {
        self.release_with(name, None)
    }

    pub(crate) fn release_with(
        &self,
        name: &str,
        finalizer: Option<Finalizer>,
    ) -> ShmResult<ReleaseOutcome> {
        {
            let _read = self.segment.registry_lock().read()?;
            let store = self.segment.store();
            let Some(record) = store.get(name) else {
                tracing::warn!("Release of unknown variable '{}'", name);
                return Ok(ReleaseOutcome::NotAttached);
            };
            let Some(remaining) = record.release() else {
                tracing::warn!("Release of '{}' with no attachments", name);
                return Ok(ReleaseOutcome::NotAttached);
            };
            if remaining > 0 {
                return Ok(ReleaseOutcome::StillReferenced(remaining));
            }
            if record.is_persistent() {
                return Ok(ReleaseOutcome::Retained);
            }
        }

        self.reclaim(name, finalizer, false)
    }

    /// Erase `name` and free its payload if nobody is attached.
    ///
    /// Persistent variables are removed too. Returns `false` when the name is
    /// absent or still referenced.
    pub fn remove(&self, name: &str) -> ShmResult<bool> {
        {
            let _read = self.segment.registry_lock().read()?;
            if self.segment.store().get(name).is_none() {
                return Ok(false);
            }
        }
        Ok(self.reclaim(name, None, true)? == ReleaseOutcome::Reclaimed)
    }

    fn reclaim(
        &self,
        name: &str,
        finalizer: Option<Finalizer>,
        include_persistent: bool,
    ) -> ShmResult<ReleaseOutcome> {
        let _write = self.segment.registry_lock().write()?;
        let store = self.segment.store();

        let Ok(idx) = store.find(name) else {
            return Ok(ReleaseOutcome::NotAttached);
        };
        let record = &store.records()[idx];
        let count = record.ref_count();
        if count > 0 {
            tracing::debug!("'{}' re-attached before reclamation ({} refs)", name, count);
            return Ok(ReleaseOutcome::Reattached);
        }
        if record.is_persistent() && !include_persistent {
            return Ok(ReleaseOutcome::Retained);
        }

        let (offset, size) = (record.offset(), record.size());
        if let Some(finalize) = finalizer {
            let payload = self.segment.ptr_at(offset, size)?;
            unsafe { finalize(payload) };
        }
        store.remove_at(idx);
        self.segment.heap().free(offset)?;

        tracing::debug!("Reclaimed '{}' ({} bytes at {:#x})", name, size, offset);
        Ok(ReleaseOutcome::Reclaimed)
    }

    /// Snapshot of every variable, ordered by name
    pub fn list_all(&self) -> ShmResult<Vec<VarEntry>> {
        let _read = self.segment.registry_lock().read()?;
        self.segment
            .store()
            .records()
            .iter()
            .map(|record| {
                Ok(VarEntry {
                    address: self.segment.ptr_at(record.offset(), record.size())?,
                    info: record.info(),
                })
            })
            .collect()
    }

    /// Change the persistence of `name`.
    ///
    /// Clearing the flag on a variable nobody is attached to reclaims it.
    pub fn set_persistent(&self, name: &str, persistent: bool) -> ShmResult<()> {
        let _write = self.segment.registry_lock().write()?;
        let store = self.segment.store();

        let idx = store.find(name).map_err(|_| ShmError::NotFound {
            name: name.to_string(),
        })?;
        let Some(record) = store.get_mut(idx) else {
            return Err(ShmError::NotFound {
                name: name.to_string(),
            });
        };
        record.set_persistent(persistent);

        if !persistent && record.ref_count() == 0 {
            let offset = store.remove_at(idx);
            self.segment.heap().free(offset)?;
            tracing::debug!("Reclaimed '{}' after clearing persistence", name);
        }
        Ok(())
    }

    /// Copy of the payload bytes of `name`
    pub fn read_bytes(&self, name: &str) -> ShmResult<Vec<u8>> {
        self.read_var(name).map(|(_, bytes)| bytes)
    }

    /// Record snapshot and payload copy of `name`, taken under one lock
    pub fn read_var(&self, name: &str) -> ShmResult<(VarInfo, Vec<u8>)> {
        let _read = self.segment.registry_lock().read()?;
        let store = self.segment.store();
        let record = store.get(name).ok_or_else(|| ShmError::NotFound {
            name: name.to_string(),
        })?;
        let payload = self.segment.ptr_at(record.offset(), record.size())?;
        let mut out = vec![0u8; record.size()];
        unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), out.as_mut_ptr(), out.len());
        }
        Ok((record.info(), out))
    }

    /// Overwrite the payload of `name`; `bytes` must match its size.
    pub fn write_bytes(&self, name: &str, bytes: &[u8]) -> ShmResult<()> {
        let _read = self.segment.registry_lock().read()?;
        let store = self.segment.store();
        let record = store.get(name).ok_or_else(|| ShmError::NotFound {
            name: name.to_string(),
        })?;
        if record.size() != bytes.len() {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                recorded: record.size(),
                requested: bytes.len(),
            });
        }
        let payload = self.segment.ptr_at(record.offset(), record.size())?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), payload.as_ptr(), bytes.len());
        }
        Ok(())
    }

    /// Raw allocation from the segment heap, aligned to 16 bytes
    pub fn allocate(&self, size: usize) -> ShmResult<NonNull<u8>> {
        let _write = self.segment.registry_lock().write()?;
        let offset = self.segment.heap().allocate(size)?;
        self.segment.ptr_at(offset, size)
    }

    /// Return memory obtained from [`allocate`](Self::allocate)
    pub fn free(&self, ptr: NonNull<u8>) -> ShmResult<()> {
        let offset = self.segment.offset_of(ptr.as_ptr())?;
        let _write = self.segment.registry_lock().write()?;
        self.segment.heap().free(offset)
    }

    /// Process-local address of `len` bytes at a segment offset
    pub fn ptr_at(&self, offset: u64, len: usize) -> ShmResult<NonNull<u8>> {
        self.segment.ptr_at(offset, len)
    }

    /// Segment offset of a process-local address
    pub fn offset_of(&self, ptr: *const u8) -> ShmResult<u64> {
        self.segment.offset_of(ptr)
    }

    pub fn stats(&self) -> ShmResult<RegistryStats> {
        let _read = self.segment.registry_lock().read()?;
        let store = self.segment.store();
        let records = store.records();
        let creator_pid = self.segment.creator_pid();

        Ok(RegistryStats {
            segment_name: self.segment.name().to_string(),
            capacity: self.segment.capacity(),
            owner: self.segment.is_owner(),
            creator_pid,
            creator_alive: crate::platform::is_process_alive(creator_pid),
            created_ts: self.segment.created_ts(),
            records: records.len(),
            record_capacity: store.capacity(),
            persistent_records: records.iter().filter(|r| r.is_persistent()).count(),
            referenced_records: records.iter().filter(|r| r.ref_count() > 0).count(),
            heap: self.segment.heap().stats(),
        })
    }
}

/// Payload allocated for a record that is not published yet.
///
/// Dropping it, on an error return or an unwinding initializer, gives the
/// block back to the heap.
struct PendingPayload<'a> {
    heap: &'a Heap,
    offset: u64,
}

impl Drop for PendingPayload<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.heap.free(self.offset) {
            tracing::error!("Failed to free unpublished payload at {:#x}: {}", self.offset, e);
        }
    }
}

fn check_layout(name: &str, record: &VarRecord, type_tag: TypeTag, size: usize) -> ShmResult<()> {
    if record.type_tag() != type_tag {
        return Err(ShmError::TypeMismatch {
            name: name.to_string(),
            recorded: record.type_tag(),
            requested: type_tag,
        });
    }
    if record.size() != size {
        return Err(ShmError::SizeMismatch {
            name: name.to_string(),
            recorded: record.size(),
            requested: size,
        });
    }
    Ok(())
}

fn check_alignment(ptr: NonNull<u8>, align: usize) -> ShmResult<()> {
    let address = ptr.as_ptr() as usize;
    if align > ALLOC_ALIGN || address % align != 0 {
        return Err(ShmError::AlignmentError {
            address,
            alignment: align,
        });
    }
    Ok(())
}
