//! Cross-process locks living inside the shared segment
//!
//! Both primitives wrap pthread objects initialized with
//! `PTHREAD_PROCESS_SHARED`, so a lock taken through one mapping blocks every
//! other mapping of the same segment, in this or any other process. Acquisition
//! blocks without timeout.

use crate::error::{ShmError, ShmResult};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::addr_of;

fn lock_error(rc: libc::c_int, operation: &'static str) -> ShmError {
    ShmError::Lock {
        operation,
        source: nix::Error::from_raw(rc),
    }
}

fn check(rc: libc::c_int, operation: &'static str) -> ShmResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(lock_error(rc, operation))
    }
}

/// Process-shared mutex serializing variable creation
///
/// On Linux the mutex is robust: if a process dies while holding it, the next
/// locker recovers it instead of blocking forever.
#[repr(C)]
pub struct ShmMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: all access goes through pthread calls designed for concurrent use.
unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Initialize a mutex in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable, suitably aligned memory that no other
    /// thread or process is using as a lock yet.
    pub unsafe fn init_in_place(this: *mut Self) -> ShmResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        unsafe {
            check(
                libc::pthread_mutexattr_init(attr.as_mut_ptr()),
                "pthread_mutexattr_init",
            )?;

            let mut rc =
                libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            #[cfg(target_os = "linux")]
            if rc == 0 {
                rc = libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST);
            }
            if rc == 0 {
                rc = libc::pthread_mutex_init(UnsafeCell::raw_get(addr_of!((*this).raw)), attr.as_ptr());
            }

            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            check(rc, "pthread_mutex_init")
        }
    }

    /// Block until the mutex is held
    pub fn lock(&self) -> ShmResult<ShmMutexGuard<'_>> {
        let rc = unsafe { libc::pthread_mutex_lock(self.raw.get()) };
        match rc {
            0 => {}
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                tracing::warn!("Previous holder of the creation lock died, recovering it");
                let rc = unsafe { libc::pthread_mutex_consistent(self.raw.get()) };
                if rc != 0 {
                    unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
                    return Err(lock_error(rc, "pthread_mutex_consistent"));
                }
            }
            rc => return Err(lock_error(rc, "pthread_mutex_lock")),
        }
        Ok(ShmMutexGuard { mutex: self })
    }
}

/// RAII guard for [`ShmMutex`]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        unsafe { libc::pthread_mutex_unlock(self.mutex.raw.get()) };
    }
}

/// Process-shared reader/writer lock guarding the record store and allocator
#[repr(C)]
pub struct ShmRwLock {
    raw: UnsafeCell<libc::pthread_rwlock_t>,
}

// SAFETY: all access goes through pthread calls designed for concurrent use.
unsafe impl Send for ShmRwLock {}
unsafe impl Sync for ShmRwLock {}

impl ShmRwLock {
    /// Initialize a reader/writer lock in place.
    ///
    /// # Safety
    ///
    /// Same contract as [`ShmMutex::init_in_place`].
    pub unsafe fn init_in_place(this: *mut Self) -> ShmResult<()> {
        let mut attr = MaybeUninit::<libc::pthread_rwlockattr_t>::uninit();
        unsafe {
            check(
                libc::pthread_rwlockattr_init(attr.as_mut_ptr()),
                "pthread_rwlockattr_init",
            )?;

            let mut rc =
                libc::pthread_rwlockattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
            if rc == 0 {
                rc = libc::pthread_rwlock_init(UnsafeCell::raw_get(addr_of!((*this).raw)), attr.as_ptr());
            }

            libc::pthread_rwlockattr_destroy(attr.as_mut_ptr());
            check(rc, "pthread_rwlock_init")
        }
    }

    /// Acquire in shared mode
    pub fn read(&self) -> ShmResult<ShmReadGuard<'_>> {
        check(
            unsafe { libc::pthread_rwlock_rdlock(self.raw.get()) },
            "pthread_rwlock_rdlock",
        )?;
        Ok(ShmReadGuard { lock: self })
    }

    /// Acquire in exclusive mode
    pub fn write(&self) -> ShmResult<ShmWriteGuard<'_>> {
        check(
            unsafe { libc::pthread_rwlock_wrlock(self.raw.get()) },
            "pthread_rwlock_wrlock",
        )?;
        Ok(ShmWriteGuard { lock: self })
    }

    fn unlock(&self) {
        unsafe { libc::pthread_rwlock_unlock(self.raw.get()) };
    }
}

/// Shared-mode guard for [`ShmRwLock`]
pub struct ShmReadGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Exclusive-mode guard for [`ShmRwLock`]
pub struct ShmWriteGuard<'a> {
    lock: &'a ShmRwLock,
}

impl Drop for ShmWriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}
