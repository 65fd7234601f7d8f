//! # Shared Variable Registry
//!
//! Named, typed variables that live in one shared memory segment and are
//! visible to every cooperating process. A process asks for a variable by
//! name; the first asker creates and initializes it, everyone after attaches
//! to the same storage. Each variable carries a reference count so that
//! transient variables disappear with their last handle, while persistent
//! ones stay until explicitly removed.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── segment ─────────────────────────────────┐
//! │ SegmentHeader                    │ heap                                  │
//! │  magic / version / state         │  ┌──────────────┐ ┌───────┐ ┌───────┐ │
//! │  creation lock (pthread mutex)   │  │ record table │ │payload│ │payload│ │
//! │  registry lock (pthread rwlock)  │  │ sorted by    │ │  "a"  │ │  "b"  │ │
//! │  store + heap bookkeeping        │  │ name         │ └───────┘ └───────┘ │
//! │                                  │  └──────────────┘                     │
//! └──────────────────────────────────────────────────────────────────────────┘
//!        ▲                                    ▲
//!        │ Registry (one per process)         │ SharedVar<T> (one per use site)
//! ```
//!
//! Every location inside the segment is stored as an offset from its start,
//! so processes mapping it at different addresses agree on all of them.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shvar::config::RegistryConfig;
//! use shvar_registry::{Registry, SharedVar};
//! use std::sync::atomic::{AtomicBool, Ordering};
//!
//! # fn main() -> shvar_registry::ShmResult<()> {
//! let registry = Registry::open(&RegistryConfig::default())?;
//!
//! // Transient: removed when the last handle anywhere is dropped.
//! let stop = SharedVar::<AtomicBool>::open(&registry, "stopRunning")?;
//!
//! // Persistent: survives with no handles, keeps its value for the next opener.
//! let level = SharedVar::<i32>::builder("loggerLevel")
//!     .description("Global log verbosity")
//!     .persistent(true)
//!     .initial(2)
//!     .open(&registry)?;
//!
//! if !stop.load(Ordering::Acquire) {
//!     println!("log level {}", level.get());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Application Types
//!
//! Any self-contained `#[repr(C)]` type can be shared once it implements
//! [`ShmValue`] and is bound to a stable [`TypeTag`] in the registry's
//! [`TypeTable`]. Handles to plain values copy them in and out with
//! `get`/`set`; types made of atomics can also implement [`SharedAccess`]
//! and be used in place through `Deref`. Tags, not Rust type identities, are what the segment
//! records, so every process must register the same tag for the same type.
//!
//! ## Error Handling
//!
//! All fallible operations return [`ShmResult`]. Attaching with the wrong
//! type or size reports [`ShmError::TypeMismatch`] or
//! [`ShmError::SizeMismatch`] and leaves the variable untouched; a full
//! segment reports [`ShmError::OutOfMemory`] with the largest block still
//! available.

#![warn(clippy::all)]

pub mod error;
pub mod heap;
pub mod placement;
pub mod platform;
pub mod record;
pub mod registry;
pub mod segment;
pub mod store;
pub mod sync;
pub mod types;
pub mod var;

pub use error::{ShmError, ShmResult};
pub use heap::HeapStats;
pub use placement::{PayloadLayout, SharedAccess, ShmValue};
pub use record::{RecordFlags, VarInfo, VarName};
pub use registry::{Registry, RegistryStats, ReleaseOutcome, VarEntry};
pub use segment::{LAYOUT_VERSION, SHVAR_MAGIC, SegmentHeader};
pub use types::{Formatter, Parser, TypeEntry, TypeTable, TypeTag, hex_dump, tags};
pub use var::{SharedVar, VarBuilder};

/// Initialize tracing for library consumers that have no subscriber of their own
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
