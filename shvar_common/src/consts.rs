//! System-wide constants for the shvar workspace.
//!
//! Single source of truth for all numeric limits and default names.
//! Every process sharing a segment must be built against the same values:
//! they shape the in-segment layout.

/// Maximum length of a variable name in bytes.
pub const MAX_NAME_LEN: usize = 48;

/// Maximum length of a variable description in bytes.
pub const MAX_DESCRIPTION_LEN: usize = 64;

/// Maximum length of a segment name in bytes (file name limit on Linux).
pub const MAX_SEGMENT_NAME_LEN: usize = 255;

/// Default segment name shared by cooperating processes.
pub const DEFAULT_SEGMENT_NAME: &str = "shvar_registry_v0";

/// Default segment capacity in bytes (2MB).
pub const DEFAULT_SEGMENT_SIZE: usize = 2 * 1024 * 1024;

/// Default directory holding segment backing files.
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";

/// Default time an opener waits for the creator to finish initializing.
pub const DEFAULT_ATTACH_TIMEOUT_MS: u64 = 2000;

/// Minimum segment size in bytes.
///
/// One memory page. Smaller segments could not hold the header, the
/// initial record table and any payload.
pub const SHM_MIN_SIZE: usize = 4096;

/// Maximum segment size in bytes (1GB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// CPU cache line size in bytes.
///
/// The segment header and the start of the allocator heap are aligned to it.
pub const CACHE_LINE_SIZE: usize = 64;

/// Alignment of every payload handed out by the segment allocator.
pub const ALLOC_ALIGN: usize = 16;

/// Number of records the store can hold before its first growth.
pub const INITIAL_RECORD_CAPACITY: usize = 16;

/// Environment variable overriding the segment name.
pub const ENV_SEGMENT_NAME: &str = "SHVAR_SEGMENT_NAME";

/// Environment variable overriding the segment capacity in bytes.
pub const ENV_SEGMENT_SIZE: &str = "SHVAR_SEGMENT_SIZE";

/// Environment variable overriding the backing file directory.
pub const ENV_SHM_DIR: &str = "SHVAR_SHM_DIR";
