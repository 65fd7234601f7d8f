//! Platform-specific segment backing

#[cfg(unix)]
mod linux;

#[cfg(unix)]
pub use linux::*;
