//! Error types for shared variable registry operations

use crate::types::TypeTag;
use shvar::config::ConfigError;
use thiserror::Error;

/// Errors that can occur during registry and variable operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment could be neither created nor opened
    #[error("Shared segment unavailable: {name} ({reason})")]
    BackingUnavailable {
        /// Segment name
        name: String,
        /// What went wrong
        reason: String,
    },

    /// Attach request disagrees with the recorded type tag
    #[error("Type mismatch for '{name}': recorded tag {recorded}, requested tag {requested}")]
    TypeMismatch {
        /// Variable name
        name: String,
        /// Tag stored in the record
        recorded: TypeTag,
        /// Tag presented by the caller
        requested: TypeTag,
    },

    /// Attach request disagrees with the recorded payload size
    #[error("Size mismatch for '{name}': recorded {recorded} bytes, requested {requested} bytes")]
    SizeMismatch {
        /// Variable name
        name: String,
        /// Size stored in the record
        recorded: usize,
        /// Size presented by the caller
        requested: usize,
    },

    /// Segment allocator cannot satisfy the request
    #[error("Shared segment exhausted: {requested} bytes requested, largest free block {largest_free} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
        /// Largest contiguous free payload at the time of the request
        largest_free: usize,
    },

    /// Variable not found
    #[error("Variable not found: {name}")]
    NotFound {
        /// Variable name
        name: String,
    },

    /// Variable name empty or too long
    #[error("Invalid variable name '{name}': must be 1..={max} bytes")]
    InvalidName {
        /// Offending name
        name: String,
        /// Maximum length in bytes
        max: usize,
    },

    /// Variable description too long
    #[error("Description of '{name}' exceeds {max} bytes")]
    DescriptionTooLong {
        /// Variable name
        name: String,
        /// Maximum length in bytes
        max: usize,
    },

    /// Invalid payload or buffer size
    #[error("Invalid size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Memory alignment error
    #[error("Memory alignment error: address {address:#x} not aligned to {alignment}")]
    AlignmentError {
        /// Memory address
        address: usize,
        /// Required alignment
        alignment: usize,
    },

    /// Payload type needs stricter alignment than the allocator provides
    #[error("{type_name} requires {align}-byte alignment, segment allocations guarantee {max}")]
    UnsupportedAlignment {
        /// Rust type name
        type_name: &'static str,
        /// Alignment the type requires
        align: usize,
        /// Alignment of every allocation
        max: usize,
    },

    /// No tag registered for a payload type
    #[error("No type tag registered for {type_name}")]
    UnregisteredType {
        /// Rust type name
        type_name: &'static str,
    },

    /// Tag value reserved or out of range
    #[error("Invalid type tag: {tag}")]
    InvalidTypeTag {
        /// Offending tag
        tag: TypeTag,
    },

    /// Tag already bound to another type
    #[error("Type tag {tag} already registered for {existing}")]
    DuplicateTypeTag {
        /// Offending tag
        tag: TypeTag,
        /// Type already owning the tag
        existing: &'static str,
    },

    /// Offset or pointer does not refer to a live allocation
    #[error("Invalid segment offset: {offset:#x}")]
    InvalidOffset {
        /// Segment-relative offset
        offset: u64,
    },

    /// Cross-process lock operation failed
    #[error("Lock operation {operation} failed: {source}")]
    Lock {
        /// pthread call that failed
        operation: &'static str,
        /// Source errno
        source: nix::Error,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Configuration error
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: ConfigError,
    },
}

/// Result type for registry operations
pub type ShmResult<T> = Result<T, ShmError>;
