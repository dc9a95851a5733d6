use super::texture::TextureObject;
use crate::driver::TextureHandle;
use crate::space::MemorySpace;
use crate::utils::format_bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Routine that releases a record's storage: `(space, ptr, size)`.
pub type DeallocFn = Arc<dyn Fn(MemorySpace, *mut u8, usize) + Send + Sync>;

/// Process-unique identity of an allocation record. Survives reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(u64);

impl RecordId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

/// Mutable part of a record, guarded by the record's mutex.
pub(crate) struct RecordState {
    pub(crate) ptr: *mut u8,
    pub(crate) size: usize,
    pub(crate) texture: Option<TextureObject>,
    pub(crate) dealloc: Option<DeallocFn>,
}

impl RecordState {
    /// Set once the last reference is gone and the storage has been freed.
    pub(crate) fn is_released(&self) -> bool {
        self.ptr.is_null()
    }
}

// The pointer is only an address here; access to the bytes goes through the driver.
unsafe impl Send for RecordState {}

/// Tracking metadata for one buffer: label, size, space, reference count,
/// deallocation routine and the cached texture handle.
///
/// Records are only created by the registry's allocate entry points.
pub struct AllocationRecord {
    id: RecordId,
    space: MemorySpace,
    label: String,
    ref_count: AtomicUsize,
    state: Mutex<RecordState>,
}

impl AllocationRecord {
    pub(crate) fn new(
        space: MemorySpace,
        label: String,
        ptr: *mut u8,
        size: usize,
        dealloc: DeallocFn,
    ) -> Self {
        Self {
            id: RecordId::next(),
            space,
            label,
            ref_count: AtomicUsize::new(1),
            state: Mutex::new(RecordState {
                ptr,
                size,
                texture: None,
                dealloc: Some(dealloc),
            }),
        }
    }

    #[must_use]
    pub const fn id(&self) -> RecordId {
        self.id
    }

    #[must_use]
    pub const fn space(&self) -> MemorySpace {
        self.space
    }

    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current base address of the allocation. Null once released.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.lock_state().ptr
    }

    /// Current size of the allocation in bytes. Zero once released.
    #[must_use]
    pub fn size(&self) -> usize {
        self.lock_state().size
    }

    /// Whether the storage has been freed. A released record stays readable
    /// through outstanding `Arc`s but can no longer be used.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.lock_state().is_released()
    }

    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// The cached texture handle, if one has been attached.
    #[must_use]
    pub fn texture(&self) -> Option<TextureHandle> {
        self.lock_state().texture.map(|t| t.handle)
    }

    #[must_use]
    pub fn snapshot(&self) -> RecordSnapshot {
        let state = self.lock_state();
        RecordSnapshot {
            id: self.id,
            space: self.space,
            label: self.label.clone(),
            addr: state.ptr as usize,
            size: state.size,
            ref_count: self.ref_count(),
            texture: state.texture.map(|t| t.handle),
        }
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, RecordState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn increment(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the count after the decrement.
    pub(crate) fn decrement(&self) -> usize {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "record {} released below zero", self.id.0);
        previous - 1
    }
}

impl fmt::Debug for AllocationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("AllocationRecord")
            .field("id", &self.id)
            .field("space", &self.space)
            .field("label", &self.label)
            .field("ptr", &state.ptr)
            .field("size", &state.size)
            .field("ref_count", &self.ref_count())
            .field("texture", &state.texture)
            .finish()
    }
}

/// Point-in-time copy of a record for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub id: RecordId,
    pub space: MemorySpace,
    pub label: String,
    pub addr: usize,
    pub size: usize,
    pub ref_count: usize,
    pub texture: Option<TextureHandle>,
}

impl fmt::Display for RecordSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: 0x{:012x} + {} ({}) rc={} \"{}\"",
            self.space,
            self.addr,
            self.size,
            format_bytes(self.size),
            self.ref_count,
            self.label
        )?;
        if let Some(tex) = self.texture {
            write!(f, " tex={}", tex.0)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> DeallocFn {
        Arc::new(|_, _, _| {})
    }

    #[test]
    fn ids_are_unique() {
        let a = AllocationRecord::new(MemorySpace::Device, "a".into(), 0x100 as *mut u8, 8, noop());
        let b = AllocationRecord::new(MemorySpace::Device, "b".into(), 0x200 as *mut u8, 8, noop());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn counts_up_and_down() {
        let r = AllocationRecord::new(MemorySpace::Host, "r".into(), 0x100 as *mut u8, 8, noop());
        assert_eq!(r.ref_count(), 1);
        assert_eq!(r.increment(), 2);
        assert_eq!(r.decrement(), 1);
        assert_eq!(r.decrement(), 0);
    }

    #[test]
    fn snapshot_display() {
        let r = AllocationRecord::new(
            MemorySpace::RestrictedDevice,
            "weights".into(),
            0x1000 as *mut u8,
            2048,
            noop(),
        );
        let line = r.snapshot().to_string();
        assert_eq!(
            line,
            "RestrictedDeviceSpace: 0x000000001000 + 2048 (2.00 KiB) rc=1 \"weights\""
        );
    }
}
