//! Typed handles to shared variables

use crate::error::{ShmError, ShmResult};
use crate::placement::{PayloadLayout, SharedAccess, ShmValue, finalizer_for, init_in_place};
use crate::record::{VarInfo, VarName, bounded, validate_description, validate_name};
use crate::registry::{Registry, ReleaseOutcome};
use crate::types::TypeTag;
use std::fmt;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::Arc;

/// A named `T` living in the shared segment
///
/// Opening a handle either creates the variable or attaches to the one
/// another handle (in this or another process) created; either way the
/// record's reference count goes up by one. Dropping or [releasing](Self::release)
/// the handle takes it back down, and the last release of a non-persistent
/// variable destroys it.
///
/// Payloads that implement [`SharedAccess`] (the atomics) are used through
/// [`Deref`]. Plain `Copy` payloads are only reachable through the volatile
/// copies of [`get`](Self::get) and [`set`](Self::set), so no borrow of the
/// value is ever alive while another handle writes it.
///
/// # Example
///
/// ```rust,no_run
/// use shvar_registry::{Registry, SharedVar};
/// use shvar::config::RegistryConfig;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// # fn main() -> shvar_registry::ShmResult<()> {
/// let registry = Registry::open(&RegistryConfig::default())?;
/// let stop = SharedVar::<AtomicBool>::builder("stopRunning")
///     .description("Set to stop all workers")
///     .open(&registry)?;
///
/// stop.store(true, Ordering::Release);
/// # Ok(())
/// # }
/// ```
pub struct SharedVar<T: ShmValue> {
    registry: Arc<Registry>,
    name: VarName,
    type_tag: TypeTag,
    offset: u64,
    ptr: NonNull<T>,
    created: bool,
    released: bool,
}

// SAFETY: the payload lives in shared memory, access is `&T` only.
unsafe impl<T: ShmValue + Sync> Send for SharedVar<T> {}
unsafe impl<T: ShmValue + Sync> Sync for SharedVar<T> {}

impl<T: ShmValue> SharedVar<T> {
    /// Start configuring a handle to `name`.
    pub fn builder(name: &str) -> VarBuilder<T> {
        VarBuilder {
            name: name.to_string(),
            description: String::new(),
            persistent: false,
            type_tag: None,
            initial: None,
        }
    }

    /// Attach to `name`, creating it with `T::default()` if absent.
    pub fn open(registry: &Arc<Registry>, name: &str) -> ShmResult<Self>
    where
        T: Default,
    {
        Self::builder(name).open(registry)
    }

    fn construct<F>(registry: &Arc<Registry>, builder: VarBuilder<T>, make: F) -> ShmResult<Self>
    where
        F: FnOnce() -> T,
    {
        let VarBuilder {
            name,
            description,
            persistent,
            type_tag,
            initial,
        } = builder;

        validate_name(&name)?;
        validate_description(&name, &description)?;

        let type_tag = match type_tag {
            Some(tag) => tag,
            None => registry
                .types()
                .tag_of::<T>()
                .ok_or(ShmError::UnregisteredType {
                    type_name: std::any::type_name::<T>(),
                })?,
        };
        let layout = PayloadLayout::of::<T>(type_tag)?;

        let (offset, created) = match registry.attach(&name, layout.type_tag, layout.size)? {
            Some(offset) => (offset, false),
            None => registry.create_or_attach_with(
                &name,
                &description,
                &layout,
                persistent,
                |payload| {
                    let value = initial.unwrap_or_else(make);
                    // SAFETY: fresh allocation sized and aligned for `T`
                    unsafe { init_in_place(payload, value) }
                },
            )?,
        };

        let ptr = match registry.ptr_at(offset, layout.size) {
            Ok(ptr) => ptr.cast::<T>(),
            Err(e) => {
                let _ = registry.release_with(&name, finalizer_for::<T>());
                return Err(e);
            }
        };

        tracing::debug!(
            "{} '{}' ({})",
            if created { "Created" } else { "Attached" },
            name,
            std::any::type_name::<T>()
        );

        Ok(Self {
            registry: Arc::clone(registry),
            name: bounded(&name),
            type_tag,
            offset,
            ptr,
            created,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle created the variable
    pub fn is_owner(&self) -> bool {
        self.created
    }

    /// Current persistence of the variable, queried from the segment
    pub fn is_persistent(&self) -> bool {
        match self.registry.exists(&self.name) {
            Ok(info) => info.is_some_and(|info| info.persistent),
            Err(e) => {
                tracing::warn!("Cannot query '{}': {}", self.name, e);
                false
            }
        }
    }

    /// Make the variable outlive its last handle, or stop it from doing so.
    pub fn set_persistent(&self, persistent: bool) -> ShmResult<()> {
        self.registry.set_persistent(&self.name, persistent)
    }

    /// Snapshot of the variable's record
    pub fn info(&self) -> ShmResult<Option<VarInfo>> {
        self.registry.exists(&self.name)
    }

    /// Number of handles attached across all processes, `0` if unknown
    pub fn ref_count(&self) -> u32 {
        self.info().ok().flatten().map_or(0, |info| info.ref_count)
    }

    pub fn type_tag(&self) -> TypeTag {
        self.type_tag
    }

    /// Segment-relative payload offset, identical in every process
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Payload address in this process
    pub fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Volatile read of the whole value
    pub fn get(&self) -> T
    where
        T: Copy,
    {
        unsafe { std::ptr::read_volatile(self.ptr.as_ptr()) }
    }

    /// Volatile write of the whole value
    pub fn set(&self, value: T)
    where
        T: Copy,
    {
        unsafe { std::ptr::write_volatile(self.ptr.as_ptr(), value) }
    }

    /// Detach explicitly, reporting what happened to the variable.
    pub fn release(mut self) -> ShmResult<ReleaseOutcome> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> ShmResult<ReleaseOutcome> {
        if self.released {
            return Ok(ReleaseOutcome::NotAttached);
        }
        self.released = true;
        self.registry.release_with(&self.name, finalizer_for::<T>())
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), size_of::<T>()) }
    }
}

impl<T: SharedAccess> Deref for SharedVar<T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ShmValue> Drop for SharedVar<T> {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::error!("Failed to release '{}': {}", self.name, e);
        }
    }
}

impl<T: ShmValue> fmt::Display for SharedVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.registry.types().render(self.type_tag, self.bytes()))
    }
}

impl<T: ShmValue> fmt::Debug for SharedVar<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedVar")
            .field("name", &self.name.as_str())
            .field("type", &std::any::type_name::<T>())
            .field("type_tag", &self.type_tag)
            .field("offset", &self.offset)
            .field("owner", &self.created)
            .finish()
    }
}

/// Options for opening a [`SharedVar`]
#[must_use]
pub struct VarBuilder<T> {
    name: String,
    description: String,
    persistent: bool,
    type_tag: Option<TypeTag>,
    initial: Option<T>,
}

impl<T: ShmValue> VarBuilder<T> {
    /// Text shown by listings. Only used when this handle creates the variable.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Keep the variable after its last handle is gone. Only used when this
    /// handle creates the variable.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Record under `tag` instead of the tag registered for `T`.
    pub fn type_tag(mut self, tag: TypeTag) -> Self {
        self.type_tag = Some(tag);
        self
    }

    /// Value stored if this handle creates the variable.
    pub fn initial(mut self, value: impl Into<T>) -> Self {
        self.initial = Some(value.into());
        self
    }

    /// Attach or create, defaulting to `T::default()`.
    pub fn open(self, registry: &Arc<Registry>) -> ShmResult<SharedVar<T>>
    where
        T: Default,
    {
        SharedVar::construct(registry, self, T::default)
    }

    /// Attach or create, producing the value with `make` when no initial
    /// value was given.
    pub fn open_with<F>(self, registry: &Arc<Registry>, make: F) -> ShmResult<SharedVar<T>>
    where
        F: FnOnce() -> T,
    {
        SharedVar::construct(registry, self, make)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tags;
    use shvar::config::RegistryConfig;
    use static_assertions::{assert_impl_all, assert_not_impl_any};
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use tempfile::TempDir;

    assert_impl_all!(SharedVar<AtomicU64>: Deref);
    assert_impl_all!(SharedVar<[AtomicU32; 4]>: Deref);
    assert_not_impl_any!(SharedVar<u64>: Deref);
    assert_not_impl_any!(SharedVar<f64>: Deref);

    fn registry(dir: &TempDir) -> Arc<Registry> {
        let config = RegistryConfig {
            shm_dir: dir.path().to_path_buf(),
            capacity: 64 * 1024,
            ..RegistryConfig::named("var_unit")
        };
        Registry::open(&config).unwrap()
    }

    #[test]
    fn test_first_handle_creates_second_attaches() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let first = SharedVar::<u32>::builder("count").initial(5u32).open(&registry).unwrap();
        let second = SharedVar::<u32>::open(&registry, "count").unwrap();

        assert!(first.is_owner());
        assert!(!second.is_owner());
        assert_eq!(second.get(), 5);
        assert_eq!(first.offset(), second.offset());
        assert_eq!(first.ref_count(), 2);
    }

    #[test]
    fn test_writes_visible_through_other_handle() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let writer = SharedVar::<AtomicU32>::open(&registry, "ticks").unwrap();
        let reader = SharedVar::<AtomicU32>::open(&registry, "ticks").unwrap();

        writer.fetch_add(3, Ordering::Relaxed);
        assert_eq!(reader.load(Ordering::Relaxed), 3);
        assert_eq!(reader.to_string(), "3");
    }

    #[test]
    fn test_last_drop_reclaims_transient() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let a = SharedVar::<u64>::open(&registry, "temp").unwrap();
        let b = SharedVar::<u64>::open(&registry, "temp").unwrap();
        drop(a);
        assert_eq!(b.ref_count(), 1);
        assert_eq!(b.release().unwrap(), ReleaseOutcome::Reclaimed);
        assert!(registry.exists("temp").unwrap().is_none());
    }

    #[test]
    fn test_persistent_outlives_handles() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        let level = SharedVar::<i32>::builder("loggerLevel")
            .persistent(true)
            .initial(3)
            .open(&registry)
            .unwrap();
        assert!(level.is_persistent());
        drop(level);

        let info = registry.exists("loggerLevel").unwrap().unwrap();
        assert_eq!(info.ref_count, 0);

        let again = SharedVar::<i32>::builder("loggerLevel").initial(9).open(&registry).unwrap();
        assert!(!again.is_owner());
        assert_eq!(again.get(), 3);
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let _flag = SharedVar::<AtomicBool>::open(&registry, "flag").unwrap();

        assert!(matches!(
            SharedVar::<u8>::open(&registry, "flag"),
            Err(ShmError::TypeMismatch { recorded: tags::ATOMIC_BOOL, requested: tags::U8, .. })
        ));
        assert!(matches!(
            SharedVar::<u16>::builder("flag").type_tag(tags::ATOMIC_BOOL).open(&registry),
            Err(ShmError::SizeMismatch { recorded: 1, requested: 2, .. })
        ));
        assert_eq!(registry.exists("flag").unwrap().unwrap().ref_count, 1);
    }

    #[test]
    fn test_unregistered_type_needs_explicit_tag() {
        #[derive(Default, Clone, Copy)]
        #[repr(C)]
        struct Point {
            x: i32,
            y: i32,
        }
        unsafe impl ShmValue for Point {}

        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);

        assert!(matches!(
            SharedVar::<Point>::open(&registry, "pt"),
            Err(ShmError::UnregisteredType { .. })
        ));

        let pt = SharedVar::<Point>::builder("pt")
            .type_tag(tags::FIRST_USER)
            .open_with(&registry, || Point { x: 1, y: -1 })
            .unwrap();
        assert_eq!(pt.get().x, 1);
        assert_eq!(pt.get().y, -1);
        assert_eq!(pt.to_string(), "01 00 00 00 FF FF FF FF");
    }

    #[test]
    fn test_set_then_get() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let speed = SharedVar::<f64>::open(&registry, "speed").unwrap();

        assert_eq!(speed.get(), 0.0);
        speed.set(2.5);
        assert_eq!(speed.get(), 2.5);
        assert_eq!(format!("{speed}"), "2.5");
        assert_eq!(registry.read_bytes("speed").unwrap(), 2.5f64.to_ne_bytes());
    }

    #[test]
    fn test_panicking_initializer_leaves_no_allocation() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir);
        let before = registry.stats().unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            SharedVar::<u64>::builder("fragile").open_with(&registry, || panic!("no value"))
        }));
        assert!(result.is_err());

        let after = registry.stats().unwrap();
        assert_eq!(after.records, 0);
        assert_eq!(after.heap, before.heap);

        // Locks were released on unwind, the name is free again.
        let var = SharedVar::<u64>::builder("fragile").initial(8u64).open(&registry).unwrap();
        assert!(var.is_owner());
        assert_eq!(var.get(), 8);
    }
}
