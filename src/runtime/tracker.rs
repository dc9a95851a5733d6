use super::context::MemoryRuntime;
use super::record::AllocationRecord;
use super::texture::TextureAlias;
use crate::driver::TextureHandle;
use crate::error::SpaceResult;
use crate::space::MemorySpace;
use std::sync::Arc;

/// Owning handle on a tracked allocation.
///
/// Cloning takes another reference on the record; dropping releases one. The
/// storage is freed when the last handle (or manual reference) goes away.
#[derive(Debug)]
pub struct TrackedBuffer {
    runtime: Arc<MemoryRuntime>,
    record: Arc<AllocationRecord>,
}

impl TrackedBuffer {
    /// Allocates a new tracked buffer.
    ///
    /// # Errors
    /// Propagates the driver's allocation failure.
    pub fn new(
        runtime: Arc<MemoryRuntime>,
        space: MemorySpace,
        label: &str,
        size: usize,
    ) -> SpaceResult<Self> {
        let ptr = runtime.allocate(space, label, size)?;
        let Some(record) = runtime.get_record(ptr) else {
            crate::error::fatal(&format!("record for {ptr:p} vanished after allocation"));
        };
        Ok(Self { runtime, record })
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.record.ptr()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.record.size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn record(&self) -> &Arc<AllocationRecord> {
        &self.record
    }

    /// Returns the buffer's texture handle, creating it on first use.
    ///
    /// # Errors
    /// Propagates the driver's failure to create the handle.
    pub fn attach_texture<A: TextureAlias>(&self) -> SpaceResult<TextureHandle> {
        self.runtime.attach_texture::<A>(&self.record)
    }

    /// Resizes the buffer; every clone sees the new storage.
    ///
    /// # Errors
    /// Propagates the driver's allocation failure.
    pub fn resize(&self, size: usize) -> SpaceResult<*mut u8> {
        self.runtime.reallocate_record(&self.record, size)
    }
}

impl Clone for TrackedBuffer {
    fn clone(&self) -> Self {
        self.runtime.retain_record(&self.record);
        Self {
            runtime: self.runtime.clone(),
            record: self.record.clone(),
        }
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.runtime.deallocate_record(&self.record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn last_clone_frees() {
        let rt = Arc::new(MemoryRuntime::with_system_driver(RuntimeConfig::default()).unwrap());
        let a = TrackedBuffer::new(rt.clone(), MemorySpace::Device, "shared", 64).unwrap();
        let ptr = a.as_ptr();

        let b = a.clone();
        assert_eq!(a.record().ref_count(), 2);
        drop(a);
        assert_eq!(rt.get_record(ptr).unwrap().ref_count(), 1);

        drop(b);
        assert!(rt.get_record(ptr).is_none());
    }

    #[test]
    fn resize_is_seen_by_clones() {
        let rt = Arc::new(MemoryRuntime::with_system_driver(RuntimeConfig::default()).unwrap());
        let a = TrackedBuffer::new(rt.clone(), MemorySpace::Host, "grow", 8).unwrap();
        let b = a.clone();

        let new_ptr = a.resize(128).unwrap();
        assert_eq!(b.as_ptr(), new_ptr);
        assert_eq!(b.len(), 128);
        assert_eq!(b.record().ref_count(), 2);
    }

    #[test]
    fn clone_and_drop_race_with_resize() {
        let rt = Arc::new(MemoryRuntime::with_system_driver(RuntimeConfig::default()).unwrap());

        for _ in 0..500 {
            let a = TrackedBuffer::new(rt.clone(), MemorySpace::Device, "race", 64).unwrap();
            let b = a.clone();

            std::thread::scope(|s| {
                s.spawn(move || {
                    for i in 0..4 {
                        b.resize(64 * (i + 2)).unwrap();
                    }
                });
                s.spawn(move || {
                    let c = a.clone();
                    drop(a);
                    drop(c);
                });
            });
        }

        assert!(rt.registry(MemorySpace::Device).is_empty());
    }
}
