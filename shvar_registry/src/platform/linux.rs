//! Linux-specific shared memory operations

use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/// Memory mapping options for a segment
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxMemoryConfig {
    /// Pre-fault pages (MAP_POPULATE)
    pub populate: bool,
}

/// Create the backing file exclusively and size it.
///
/// Returns `Ok(None)` when another process already created it.
pub fn create_segment_file(path: &Path, size: usize) -> io::Result<Option<File>> {
    let file = match OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .mode(0o600) // Owner read/write only
        .open(path)
    {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e),
    };

    file.set_len(size as u64)?;
    Ok(Some(file))
}

/// Open an existing backing file read/write
pub fn open_segment_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Map the whole backing file shared
pub fn map_segment(file: &File, config: &LinuxMemoryConfig) -> io::Result<MmapMut> {
    let mut mmap_options = MmapOptions::new();

    if config.populate {
        mmap_options.populate();
    }

    // SAFETY: the file is a shared memory object; concurrent modification by
    // other processes is the whole point and is mediated by the segment locks.
    unsafe { mmap_options.map_mut(file) }
}

/// Remove the backing file. Returns `false` if it did not exist.
pub fn unlink_segment(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Check if process is alive using kill(pid, 0)
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Null signal tests for existence without delivering anything
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::Error::ESRCH) => false,
        Err(nix::Error::EPERM) => true, // Exists, owned by someone else
        Err(_) => false,
    }
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}
