//! Typed construction and destruction of payloads inside the segment

use crate::error::{ShmError, ShmResult};
use crate::types::TypeTag;
use shvar::consts::ALLOC_ALIGN;
use std::mem::{align_of, needs_drop, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64};

/// Types that may live in shared memory.
///
/// # Safety
///
/// Implementors must be self-contained: no pointers, references or handles
/// that are only meaningful in one process, because every process sees the
/// payload at a different address. Any bit pattern a cooperating process may
/// write must be a valid value.
pub unsafe trait ShmValue: Sized + 'static {}

macro_rules! impl_shm_value {
    ($($t:ty),* $(,)?) => {
        $(unsafe impl ShmValue for $t {})*
    };
}

impl_shm_value!(
    bool, i8, u8, i16, u16, i32, u32, i64, u64, i128, u128, f32, f64,
    AtomicBool, AtomicI32, AtomicU32, AtomicI64, AtomicU64,
);

unsafe impl<T: ShmValue, const N: usize> ShmValue for [T; N] {}

/// Payloads that can be borrowed as `&T` while other handles change them.
///
/// [`SharedVar`](crate::SharedVar) only dereferences to payloads of this
/// kind; plain values go through its volatile `get` and `set`.
///
/// # Safety
///
/// Every byte of the type that can change after construction must sit
/// inside an `UnsafeCell` (atomics, for example), so that writes from other
/// handles never happen behind an immutable borrow.
pub unsafe trait SharedAccess: ShmValue {}

unsafe impl SharedAccess for AtomicBool {}
unsafe impl SharedAccess for AtomicI32 {}
unsafe impl SharedAccess for AtomicU32 {}
unsafe impl SharedAccess for AtomicI64 {}
unsafe impl SharedAccess for AtomicU64 {}
unsafe impl<T: SharedAccess, const N: usize> SharedAccess for [T; N] {}

/// Type tag, size and alignment of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLayout {
    /// Tag recorded with the variable
    pub type_tag: TypeTag,
    /// Payload size in bytes
    pub size: usize,
    /// Required alignment
    pub align: usize,
}

impl PayloadLayout {
    /// Layout of `T` under `type_tag`.
    pub fn of<T: ShmValue>(type_tag: TypeTag) -> ShmResult<Self> {
        if type_tag == 0 {
            return Err(ShmError::InvalidTypeTag { tag: type_tag });
        }
        if align_of::<T>() > ALLOC_ALIGN {
            return Err(ShmError::UnsupportedAlignment {
                type_name: std::any::type_name::<T>(),
                align: align_of::<T>(),
                max: ALLOC_ALIGN,
            });
        }
        if size_of::<T>() == 0 {
            return Err(ShmError::InvalidSize { size: 0 });
        }
        Ok(Self {
            type_tag,
            size: size_of::<T>(),
            align: align_of::<T>(),
        })
    }

    /// Untyped layout for raw byte payloads.
    pub fn bytes(type_tag: TypeTag, size: usize) -> ShmResult<Self> {
        if type_tag == 0 {
            return Err(ShmError::InvalidTypeTag { tag: type_tag });
        }
        if size == 0 {
            return Err(ShmError::InvalidSize { size });
        }
        Ok(Self {
            type_tag,
            size,
            align: 1,
        })
    }
}

/// Type-erased destructor run on a payload before its storage is freed
pub type Finalizer = unsafe fn(NonNull<u8>);

/// Move `value` into uninitialized payload storage.
///
/// # Safety
///
/// `dst` must be valid for writes of `T` and aligned for `T`.
pub(crate) unsafe fn init_in_place<T>(dst: NonNull<u8>, value: T) {
    unsafe { ptr::write(dst.cast::<T>().as_ptr(), value) }
}

/// Drop the `T` stored at `dst` without freeing its storage.
///
/// # Safety
///
/// `dst` must hold an initialized `T` that nobody uses afterwards.
pub(crate) unsafe fn finalize_in_place<T>(dst: NonNull<u8>) {
    unsafe { ptr::drop_in_place(dst.cast::<T>().as_ptr()) }
}

/// Finalizer for `T`, `None` when dropping `T` is a no-op
pub(crate) fn finalizer_for<T: ShmValue>() -> Option<Finalizer> {
    needs_drop::<T>().then_some(finalize_in_place::<T> as Finalizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked(#[allow(dead_code)] u32);

    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    unsafe impl ShmValue for Tracked {}

    #[repr(align(32))]
    struct Wide(#[allow(dead_code)] [u8; 32]);

    unsafe impl ShmValue for Wide {}

    #[test]
    fn test_layout_of_primitives() {
        let layout = PayloadLayout::of::<u64>(9).unwrap();
        assert_eq!(layout.size, 8);
        assert_eq!(layout.align, 8);

        let layout = PayloadLayout::of::<[u16; 5]>(300).unwrap();
        assert_eq!(layout.size, 10);
        assert_eq!(layout.align, 2);
    }

    #[test]
    fn test_layout_rejects_reserved_tag_and_wide_alignment() {
        assert!(matches!(
            PayloadLayout::of::<u8>(0),
            Err(ShmError::InvalidTypeTag { tag: 0 })
        ));
        assert!(matches!(
            PayloadLayout::of::<Wide>(400),
            Err(ShmError::UnsupportedAlignment { align: 32, .. })
        ));
    }

    #[test]
    fn test_layout_rejects_empty_payloads() {
        assert!(matches!(
            PayloadLayout::of::<[u32; 0]>(500),
            Err(ShmError::InvalidSize { size: 0 })
        ));
        assert!(matches!(
            PayloadLayout::bytes(500, 0),
            Err(ShmError::InvalidSize { size: 0 })
        ));
        assert_eq!(PayloadLayout::bytes(500, 3).unwrap().size, 3);
    }

    #[test]
    fn test_trivial_types_have_no_finalizer() {
        assert!(finalizer_for::<u32>().is_none());
        assert!(finalizer_for::<AtomicBool>().is_none());
        assert!(finalizer_for::<Tracked>().is_some());
    }

    #[test]
    fn test_init_then_finalize_runs_drop_once() {
        let mut slot = std::mem::MaybeUninit::<Tracked>::uninit();
        let dst = NonNull::new(slot.as_mut_ptr().cast::<u8>()).unwrap();

        let before = DROPS.load(Ordering::SeqCst);
        unsafe {
            init_in_place(dst, Tracked(7));
            let finalize = finalizer_for::<Tracked>().unwrap();
            finalize(dst);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), before + 1);
    }
}
