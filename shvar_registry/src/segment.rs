//! Segment backing, header layout and the create-or-open handshake

use crate::error::{ShmError, ShmResult};
use crate::heap::{Heap, HeapHeader};
use crate::platform::{self, LinuxMemoryConfig};
use crate::record::VarRecord;
use crate::store::{RecordStore, StoreHeader};
use crate::sync::{ShmMutex, ShmRwLock};
use memmap2::MmapMut;
use shvar::config::RegistryConfig;
use shvar::consts::{CACHE_LINE_SIZE, INITIAL_RECORD_CAPACITY};
use static_assertions::{const_assert, const_assert_eq};
use std::fs::File;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::ptr::{NonNull, addr_of, addr_of_mut};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Magic number identifying a registry segment
pub const SHVAR_MAGIC: u64 = u64::from_le_bytes(*b"SHVARREG");

/// Version of the in-segment layout
pub const LAYOUT_VERSION: u32 = 1;

const STATE_UNINIT: u32 = 0;
const STATE_READY: u32 = 1;

/// Header at offset 0 of every segment
#[repr(C, align(64))]
pub struct SegmentHeader {
    /// Magic number for validation
    pub magic: u64,
    /// In-segment layout version
    pub layout_version: u32,
    /// Publication state, flipped to ready last by the creator
    pub state: AtomicU32,
    /// Total segment size
    pub capacity: u64,
    /// Size of one record, guards against mismatched builds
    pub record_size: u32,
    /// Creator process ID
    pub creator_pid: u32,
    /// Creation timestamp (ns since epoch)
    pub created_ts: u64,
    /// Serializes variable creation
    pub creation_lock: ShmMutex,
    /// Guards the record store and the heap
    pub registry_lock: ShmRwLock,
    /// Record table bookkeeping
    pub store: StoreHeader,
    /// Allocator bookkeeping
    pub heap: HeapHeader,
}

const_assert_eq!(size_of::<SegmentHeader>() % CACHE_LINE_SIZE, 0);
const_assert!(size_of::<SegmentHeader>() <= 1024);

/// Offset where the heap begins
pub const HEAP_START: usize = size_of::<SegmentHeader>();

/// A mapped registry segment
pub struct SegmentMap {
    name: String,
    path: PathBuf,
    capacity: usize,
    owner: bool,
    base: NonNull<u8>,
    _mmap: MmapMut,
}

impl SegmentMap {
    /// Create the segment, or open it if another process already did.
    pub fn open(config: &RegistryConfig) -> ShmResult<Self> {
        let path = config.segment_path();
        let memory = LinuxMemoryConfig {
            populate: config.prefault,
        };

        match platform::create_segment_file(&path, config.capacity) {
            Ok(Some(file)) => Self::initialize(config, path, file, &memory),
            Ok(None) => Self::attach(config, path, &memory),
            Err(e) => Err(unavailable(&config.segment_name, e)),
        }
    }

    fn initialize(
        config: &RegistryConfig,
        path: PathBuf,
        file: File,
        memory: &LinuxMemoryConfig,
    ) -> ShmResult<Self> {
        let result = platform::map_segment(&file, memory)
            .map_err(|e| unavailable(&config.segment_name, e))
            .and_then(|mmap| {
                let segment = Self::from_mmap(config.segment_name.clone(), path.clone(), mmap, true)?;
                segment.format(config.capacity)?;
                Ok(segment)
            });

        match result {
            Ok(segment) => {
                tracing::info!(
                    "Created segment '{}' ({} bytes) at {}",
                    segment.name,
                    segment.capacity,
                    path.display()
                );
                Ok(segment)
            }
            Err(e) => {
                // Never leave a segment behind that openers would wait on.
                let _ = platform::unlink_segment(&path);
                Err(e)
            }
        }
    }

    fn attach(config: &RegistryConfig, path: PathBuf, memory: &LinuxMemoryConfig) -> ShmResult<Self> {
        let deadline = Instant::now() + Duration::from_millis(config.attach_timeout_ms);

        loop {
            if let Some(segment) = Self::try_attach(config, &path, memory)? {
                tracing::debug!(
                    "Opened segment '{}' ({} bytes) at {}",
                    segment.name,
                    segment.capacity,
                    path.display()
                );
                return Ok(segment);
            }
            if Instant::now() >= deadline {
                return Err(ShmError::BackingUnavailable {
                    name: config.segment_name.clone(),
                    reason: format!(
                        "segment not initialized within {}ms",
                        config.attach_timeout_ms
                    ),
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// One attempt at mapping a published segment; `None` while the creator
    /// is still formatting it.
    fn try_attach(
        config: &RegistryConfig,
        path: &Path,
        memory: &LinuxMemoryConfig,
    ) -> ShmResult<Option<Self>> {
        let name = &config.segment_name;
        let file = platform::open_segment_file(path).map_err(|e| unavailable(name, e))?;
        let len = file.metadata().map_err(|e| unavailable(name, e))?.len() as usize;
        if len < HEAP_START {
            return Ok(None);
        }

        let mmap = platform::map_segment(&file, memory).map_err(|e| unavailable(name, e))?;
        let segment = Self::from_mmap(name.clone(), path.to_path_buf(), mmap, false)?;
        let header = segment.header();

        unsafe {
            if (*header).state.load(Ordering::Acquire) != STATE_READY {
                return Ok(None);
            }
            let magic = (*header).magic;
            let version = (*header).layout_version;
            let record_size = (*header).record_size;
            let capacity = (*header).capacity as usize;

            if magic != SHVAR_MAGIC {
                return Err(incompatible(name, format!("bad magic {magic:#x}")));
            }
            if version != LAYOUT_VERSION {
                return Err(incompatible(
                    name,
                    format!("layout version {version}, expected {LAYOUT_VERSION}"),
                ));
            }
            if record_size as usize != size_of::<VarRecord>() {
                return Err(incompatible(
                    name,
                    format!("record size {record_size}, expected {}", size_of::<VarRecord>()),
                ));
            }
            if capacity != len {
                return Err(incompatible(
                    name,
                    format!("header capacity {capacity} but file holds {len} bytes"),
                ));
            }
        }

        Ok(Some(segment))
    }

    fn from_mmap(name: String, path: PathBuf, mut mmap: MmapMut, owner: bool) -> ShmResult<Self> {
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or_else(|| ShmError::BackingUnavailable {
            name: name.clone(),
            reason: "null mapping".to_string(),
        })?;
        validate_memory_alignment(base.as_ptr() as usize)?;

        Ok(Self {
            name,
            path,
            capacity: mmap.len(),
            owner,
            base,
            _mmap: mmap,
        })
    }

    /// Lay out a fresh segment and publish it.
    fn format(&self, capacity: usize) -> ShmResult<()> {
        let header = self.header();
        let created_ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        unsafe {
            debug_assert_eq!((*header).state.load(Ordering::Relaxed), STATE_UNINIT);

            addr_of_mut!((*header).magic).write(SHVAR_MAGIC);
            addr_of_mut!((*header).layout_version).write(LAYOUT_VERSION);
            addr_of_mut!((*header).capacity).write(capacity as u64);
            addr_of_mut!((*header).record_size).write(size_of::<VarRecord>() as u32);
            addr_of_mut!((*header).creator_pid).write(platform::get_current_pid());
            addr_of_mut!((*header).created_ts).write(created_ts);

            ShmMutex::init_in_place(addr_of_mut!((*header).creation_lock))?;
            ShmRwLock::init_in_place(addr_of_mut!((*header).registry_lock))?;
        }

        let heap = self.heap();
        heap.init(HEAP_START as u64, capacity as u64);
        self.store().init(&heap, INITIAL_RECORD_CAPACITY)?;

        unsafe { (*header).state.store(STATE_READY, Ordering::Release) };
        Ok(())
    }

    pub(crate) fn header(&self) -> *mut SegmentHeader {
        self.base.as_ptr().cast()
    }

    pub(crate) fn creation_lock(&self) -> &ShmMutex {
        unsafe { &*addr_of!((*self.header()).creation_lock) }
    }

    pub(crate) fn registry_lock(&self) -> &ShmRwLock {
        unsafe { &*addr_of!((*self.header()).registry_lock) }
    }

    pub(crate) fn heap(&self) -> Heap {
        unsafe { Heap::new(self.base.as_ptr(), addr_of_mut!((*self.header()).heap)) }
    }

    pub(crate) fn store(&self) -> RecordStore {
        unsafe { RecordStore::new(self.base.as_ptr(), addr_of_mut!((*self.header()).store)) }
    }

    /// Process-local address of `len` bytes at `offset`
    pub fn ptr_at(&self, offset: u64, len: usize) -> ShmResult<NonNull<u8>> {
        let end = (offset as usize).checked_add(len);
        if (offset as usize) < HEAP_START || end.is_none_or(|end| end > self.capacity) {
            return Err(ShmError::InvalidOffset { offset });
        }
        // SAFETY: bounds checked against the mapping above
        Ok(unsafe { self.base.add(offset as usize) })
    }

    /// Segment-relative offset of a process-local address
    pub fn offset_of(&self, ptr: *const u8) -> ShmResult<u64> {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base + HEAP_START || addr >= base + self.capacity {
            return Err(ShmError::InvalidOffset {
                offset: addr.wrapping_sub(base) as u64,
            });
        }
        Ok((addr - base) as u64)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether this mapping created and formatted the segment
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn base(&self) -> *const u8 {
        self.base.as_ptr()
    }

    pub fn creator_pid(&self) -> u32 {
        unsafe { (*self.header()).creator_pid }
    }

    /// Creation time in nanoseconds since the epoch
    pub fn created_ts(&self) -> u64 {
        unsafe { (*self.header()).created_ts }
    }
}

fn unavailable(name: &str, e: std::io::Error) -> ShmError {
    ShmError::BackingUnavailable {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

fn incompatible(name: &str, reason: String) -> ShmError {
    ShmError::BackingUnavailable {
        name: name.to_string(),
        reason: format!("incompatible segment: {reason}"),
    }
}

/// Validate memory alignment
pub fn validate_memory_alignment(address: usize) -> ShmResult<()> {
    if address % CACHE_LINE_SIZE != 0 {
        return Err(ShmError::AlignmentError {
            address,
            alignment: CACHE_LINE_SIZE,
        });
    }
    Ok(())
}
