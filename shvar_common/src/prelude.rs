//! Prelude module for common re-exports.
//!
//! This module provides convenient re-exports of commonly used types
//! so that consumers can do `use shvar_common::prelude::*;` and get
//! the most important types without listing individual paths.
//!
//! # Usage
//!
//! ```rust
//! use shvar_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, MonitorConfig, RegistryConfig, SharedConfig};

// ─── Limits ─────────────────────────────────────────────────────────
pub use crate::consts::{
    DEFAULT_SEGMENT_NAME, DEFAULT_SEGMENT_SIZE, MAX_DESCRIPTION_LEN, MAX_NAME_LEN,
};
