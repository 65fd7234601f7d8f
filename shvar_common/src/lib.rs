//! shvar Common Library
//!
//! This crate provides shared constants and configuration loading utilities
//! for all shvar workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Segment, record and allocator limits
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! shvar = { package = "shvar_common", path = "../shvar_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use shvar_common::consts::*;
//! use shvar_common::config::{ConfigLoader, RegistryConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
