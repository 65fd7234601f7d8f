//! First-fit allocator over the segment heap
//!
//! Every block starts with a [`BlockHeader`]; free blocks form a singly linked
//! list ordered by address so that neighbors can be coalesced on free. Links
//! are segment-relative offsets, never pointers, because each process maps the
//! segment at its own base address. Offset `0` is the segment header and
//! doubles as the list terminator.
//!
//! The allocator is not synchronized; callers hold the registry lock in
//! exclusive mode around every mutation.

use crate::error::{ShmError, ShmResult};
use serde::Serialize;
use shvar::consts::ALLOC_ALIGN;
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Size of the header preceding every payload
pub const BLOCK_HEADER_SIZE: usize = 32;

const BLOCK_MAGIC: u32 = 0x5348_424B; // "SHBK"
const STATE_FREE: u32 = 0;
const STATE_USED: u32 = 1;
const NIL: u64 = 0;
const MIN_SPLIT: u64 = (BLOCK_HEADER_SIZE + ALLOC_ALIGN) as u64;

/// Allocator bookkeeping, embedded in the segment header
#[repr(C)]
#[derive(Debug)]
pub struct HeapHeader {
    /// First byte of the heap region
    pub start: u64,
    /// One past the last byte of the heap region
    pub end: u64,
    /// Offset of the first free block, `0` if none
    pub free_head: u64,
    /// Bytes held by live blocks, headers included
    pub used_bytes: u64,
    /// Number of live blocks
    pub allocations: u64,
}

#[repr(C)]
struct BlockHeader {
    size: u64,
    next_free: u64,
    magic: u32,
    state: u32,
    _reserved: u64,
}

const_assert_eq!(size_of::<BlockHeader>(), BLOCK_HEADER_SIZE);
const_assert_eq!(BLOCK_HEADER_SIZE % ALLOC_ALIGN, 0);

/// Allocator usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeapStats {
    /// Size of the heap region
    pub total_bytes: usize,
    /// Bytes held by live blocks, headers included
    pub used_bytes: usize,
    /// Bytes available in free blocks, headers included
    pub free_bytes: usize,
    /// Largest payload a single allocation could get right now
    pub largest_free: usize,
    /// Number of free blocks (fragmentation indicator)
    pub free_blocks: usize,
    /// Number of live allocations
    pub allocations: usize,
}

const fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

/// View of the allocator inside one mapping
pub(crate) struct Heap {
    base: *mut u8,
    header: *mut HeapHeader,
}

impl Heap {
    /// # Safety
    ///
    /// `base` must be the start of a mapping containing `header` and the whole
    /// heap region it describes, and both must outlive the returned view.
    pub(crate) unsafe fn new(base: *mut u8, header: *mut HeapHeader) -> Self {
        Self { base, header }
    }

    fn block(&self, offset: u64) -> *mut BlockHeader {
        // SAFETY: offsets come from the free list or are validated by callers
        unsafe { self.base.add(offset as usize).cast() }
    }

    /// Turn `[start, end)` into one free block.
    pub(crate) fn init(&self, start: u64, end: u64) {
        let start = align_up(start, ALLOC_ALIGN as u64);
        let end = end & !(ALLOC_ALIGN as u64 - 1);
        unsafe {
            let h = self.header;
            (*h).start = start;
            (*h).end = end;
            (*h).used_bytes = 0;
            (*h).allocations = 0;
            (*h).free_head = NIL;

            if end > start && end - start >= MIN_SPLIT {
                let b = self.block(start);
                (*b).size = end - start;
                (*b).next_free = NIL;
                (*b).magic = BLOCK_MAGIC;
                (*b).state = STATE_FREE;
                (*h).free_head = start;
            }
        }
    }

    /// Allocate `size` bytes, returning the payload offset.
    pub(crate) fn allocate(&self, size: usize) -> ShmResult<u64> {
        let h = self.header;
        let (start, end) = unsafe { ((*h).start, (*h).end) };
        if size as u64 > end.saturating_sub(start) {
            return Err(self.out_of_memory(size));
        }

        let payload = align_up(size.max(1) as u64, ALLOC_ALIGN as u64);
        let need = payload + BLOCK_HEADER_SIZE as u64;

        unsafe {
            let mut prev = NIL;
            let mut cur = (*h).free_head;
            while cur != NIL {
                let b = self.block(cur);
                let block_size = (*b).size;

                if block_size >= need {
                    let next = (*b).next_free;
                    let replacement = if block_size - need >= MIN_SPLIT {
                        let rest = cur + need;
                        let r = self.block(rest);
                        (*r).size = block_size - need;
                        (*r).next_free = next;
                        (*r).magic = BLOCK_MAGIC;
                        (*r).state = STATE_FREE;
                        (*b).size = need;
                        rest
                    } else {
                        next
                    };

                    if prev == NIL {
                        (*h).free_head = replacement;
                    } else {
                        (*self.block(prev)).next_free = replacement;
                    }

                    (*b).next_free = NIL;
                    (*b).state = STATE_USED;
                    (*h).used_bytes += (*b).size;
                    (*h).allocations += 1;
                    return Ok(cur + BLOCK_HEADER_SIZE as u64);
                }

                prev = cur;
                cur = (*b).next_free;
            }
        }

        Err(self.out_of_memory(size))
    }

    /// Return a payload to the free list, merging with adjacent free blocks.
    pub(crate) fn free(&self, payload: u64) -> ShmResult<()> {
        let h = self.header;
        let off = self.used_block(payload)?;

        unsafe {
            let b = self.block(off);
            (*b).state = STATE_FREE;
            (*h).used_bytes -= (*b).size;
            (*h).allocations -= 1;

            let mut prev = NIL;
            let mut cur = (*h).free_head;
            while cur != NIL && cur < off {
                prev = cur;
                cur = (*self.block(cur)).next_free;
            }

            (*b).next_free = cur;
            if cur != NIL && off + (*b).size == cur {
                let n = self.block(cur);
                (*b).size += (*n).size;
                (*b).next_free = (*n).next_free;
                (*n).magic = 0;
            }

            if prev == NIL {
                (*h).free_head = off;
            } else {
                let p = self.block(prev);
                if prev + (*p).size == off {
                    (*p).size += (*b).size;
                    (*p).next_free = (*b).next_free;
                    (*b).magic = 0;
                } else {
                    (*p).next_free = off;
                }
            }
        }

        Ok(())
    }

    /// Usable payload bytes of a live allocation
    pub(crate) fn usable_size(&self, payload: u64) -> ShmResult<usize> {
        let off = self.used_block(payload)?;
        Ok(unsafe { (*self.block(off)).size } as usize - BLOCK_HEADER_SIZE)
    }

    /// Validate a payload offset and return its block offset
    fn used_block(&self, payload: u64) -> ShmResult<u64> {
        let h = self.header;
        let (start, end) = unsafe { ((*h).start, (*h).end) };
        let invalid = ShmError::InvalidOffset { offset: payload };

        if payload < start + BLOCK_HEADER_SIZE as u64
            || payload >= end
            || (payload - start) % ALLOC_ALIGN as u64 != 0
        {
            return Err(invalid);
        }

        let off = payload - BLOCK_HEADER_SIZE as u64;
        let b = self.block(off);
        unsafe {
            if (*b).magic != BLOCK_MAGIC || (*b).state != STATE_USED || off + (*b).size > end {
                return Err(invalid);
            }
        }
        Ok(off)
    }

    pub(crate) fn stats(&self) -> HeapStats {
        let h = self.header;
        let mut stats = HeapStats::default();
        unsafe {
            stats.total_bytes = ((*h).end - (*h).start) as usize;
            stats.used_bytes = (*h).used_bytes as usize;
            stats.allocations = (*h).allocations as usize;

            let mut cur = (*h).free_head;
            while cur != NIL {
                let b = self.block(cur);
                let size = (*b).size as usize;
                stats.free_bytes += size;
                stats.free_blocks += 1;
                stats.largest_free = stats.largest_free.max(size - BLOCK_HEADER_SIZE);
                cur = (*b).next_free;
            }
        }
        stats
    }

    fn out_of_memory(&self, requested: usize) -> ShmError {
        ShmError::OutOfMemory {
            requested,
            largest_free: self.stats().largest_free,
        }
    }
}
