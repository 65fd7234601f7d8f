//! Name-ordered record table inside the segment
//!
//! The table is a contiguous array of [`VarRecord`] allocated from the segment
//! heap, kept sorted by name bytes so lookups are a binary search and
//! listings come out ordered. When full it doubles into a fresh allocation.
//!
//! Like the heap, the store is a plain view; callers provide the locking.

use crate::error::ShmResult;
use crate::heap::Heap;
use crate::record::VarRecord;
use std::mem::size_of;
use std::ptr;

/// Table bookkeeping, embedded in the segment header
#[repr(C)]
#[derive(Debug)]
pub struct StoreHeader {
    /// Payload offset of the record array, `0` before initialization
    pub table: u64,
    /// Slots in the array
    pub capacity: u32,
    /// Occupied slots, always a sorted prefix
    pub len: u32,
}

pub(crate) struct RecordStore {
    base: *mut u8,
    header: *mut StoreHeader,
}

impl RecordStore {
    /// # Safety
    ///
    /// `base` must be the start of a mapping containing `header` and the
    /// table it describes, and both must outlive the returned view.
    pub(crate) unsafe fn new(base: *mut u8, header: *mut StoreHeader) -> Self {
        Self { base, header }
    }

    /// Allocate the initial table.
    pub(crate) fn init(&self, heap: &Heap, capacity: usize) -> ShmResult<()> {
        let table = heap.allocate(capacity * size_of::<VarRecord>())?;
        unsafe {
            (*self.header).table = table;
            (*self.header).capacity = capacity as u32;
            (*self.header).len = 0;
        }
        Ok(())
    }

    fn table(&self) -> *mut VarRecord {
        unsafe { self.base.add((*self.header).table as usize).cast() }
    }

    pub(crate) fn len(&self) -> usize {
        unsafe { (*self.header).len as usize }
    }

    pub(crate) fn capacity(&self) -> usize {
        unsafe { (*self.header).capacity as usize }
    }

    pub(crate) fn records(&self) -> &[VarRecord] {
        unsafe { std::slice::from_raw_parts(self.table(), self.len()) }
    }

    /// Slot of `name`, or the slot it would be inserted at
    pub(crate) fn find(&self, name: &str) -> Result<usize, usize> {
        self.records()
            .binary_search_by(|record| record.name_bytes().cmp(name.as_bytes()))
    }

    pub(crate) fn get(&self, name: &str) -> Option<&VarRecord> {
        self.find(name).ok().map(|idx| &self.records()[idx])
    }

    /// Mutable access to an occupied slot. Requires exclusive locking.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn get_mut(&self, idx: usize) -> Option<&mut VarRecord> {
        (idx < self.len()).then(|| unsafe { &mut *self.table().add(idx) })
    }

    /// Make room for one more record, growing the table if it is full.
    ///
    /// On failure the table is untouched.
    pub(crate) fn reserve_one(&self, heap: &Heap) -> ShmResult<()> {
        let len = self.len();
        let capacity = self.capacity();
        if len < capacity {
            return Ok(());
        }

        let old_table = unsafe { (*self.header).table };
        let fits = heap.usable_size(old_table)? / size_of::<VarRecord>();
        if fits > capacity {
            unsafe { (*self.header).capacity = fits as u32 };
            return Ok(());
        }

        let new_capacity = (capacity * 2).max(1);
        let new_table = heap.allocate(new_capacity * size_of::<VarRecord>())?;

        unsafe {
            ptr::copy_nonoverlapping(
                self.table(),
                self.base.add(new_table as usize).cast::<VarRecord>(),
                len,
            );
            (*self.header).table = new_table;
            (*self.header).capacity = new_capacity as u32;
        }
        heap.free(old_table)?;

        tracing::debug!("Record table grown from {} to {} slots", capacity, new_capacity);
        Ok(())
    }

    /// Insert at the slot returned by a failed [`find`](Self::find). Requires
    /// a prior successful [`reserve_one`](Self::reserve_one).
    pub(crate) fn insert_at(&self, idx: usize, record: VarRecord) {
        let len = self.len();
        debug_assert!(len < self.capacity());
        debug_assert!(idx <= len);

        unsafe {
            let slot = self.table().add(idx);
            ptr::copy(slot, slot.add(1), len - idx);
            ptr::write(slot, record);
            (*self.header).len += 1;
        }
    }

    /// Remove the record at `idx`, returning its payload offset.
    pub(crate) fn remove_at(&self, idx: usize) -> u64 {
        let len = self.len();
        debug_assert!(idx < len);

        unsafe {
            let slot = self.table().add(idx);
            let offset = (*slot).offset();
            ptr::copy(slot.add(1), slot, len - idx - 1);
            (*self.header).len -= 1;
            offset
        }
    }
}
