#![allow(clippy::cast_possible_truncation)]

use super::stream::HostStream;
use super::{CopyPrimitive, ExecutionContext, MemoryDriver, SendPtr, TextureHandle};
use crate::config::RuntimeConfig;
use crate::error::{SpaceError, SpaceResult};
use crate::space::MemorySpace;
use crate::utils::align_up;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

const SPACE_COUNT: usize = MemorySpace::COUNT;

/// Reference driver that backs every memory space with host memory.
///
/// Allocations come from `posix_memalign`, copies are `memcpy`, and texture
/// handles are sequence numbers. Per-space capacities from [`RuntimeConfig`]
/// are enforced so out-of-memory paths can be exercised.
pub struct SystemDriver {
    alignment: usize,
    limits: [Option<usize>; SPACE_COUNT],
    in_use: [AtomicUsize; SPACE_COUNT],
    copies: [AtomicUsize; 3],
    next_texture: AtomicU64,
    textures_created: AtomicUsize,
    textures_destroyed: AtomicUsize,
    stream: Arc<HostStream>,
}

impl std::fmt::Debug for SystemDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemDriver")
            .field("alignment", &self.alignment)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl SystemDriver {
    /// Creates the driver and its default stream.
    ///
    /// # Errors
    /// Returns an I/O error if the default stream's worker cannot be spawned.
    pub fn new(config: &RuntimeConfig) -> SpaceResult<Self> {
        let limits = MemorySpace::ALL.map(|space| config.capacity.limit(space));

        Ok(Self {
            // posix_memalign wants at least pointer alignment
            alignment: config.alignment.max(size_of::<usize>()),
            limits,
            in_use: Default::default(),
            copies: Default::default(),
            next_texture: AtomicU64::new(1),
            textures_created: AtomicUsize::new(0),
            textures_destroyed: AtomicUsize::new(0),
            stream: Arc::new(HostStream::new(MemorySpace::Device)?),
        })
    }

    /// Bytes currently handed out in `space`.
    #[must_use]
    pub fn bytes_in_use(&self, space: MemorySpace) -> usize {
        self.in_use[space.index()].load(Ordering::Acquire)
    }

    /// How many copies were lowered to `primitive`.
    #[must_use]
    pub fn copy_count(&self, primitive: CopyPrimitive) -> usize {
        self.copies[primitive_slot(primitive)].load(Ordering::Acquire)
    }

    #[must_use]
    pub fn textures_created(&self) -> usize {
        self.textures_created.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn textures_destroyed(&self) -> usize {
        self.textures_destroyed.load(Ordering::Acquire)
    }

    fn reserve(&self, space: MemorySpace, size: usize) -> SpaceResult<()> {
        let counter = &self.in_use[space.index()];

        match self.limits[space.index()] {
            None => {
                counter.fetch_add(size, Ordering::AcqRel);
                Ok(())
            }
            Some(limit) => counter
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                    used.checked_add(size).filter(|&total| total <= limit)
                })
                .map(|_| ())
                .map_err(|_| SpaceError::OutOfMemory {
                    space,
                    requested: size,
                }),
        }
    }

    fn unreserve(&self, space: MemorySpace, size: usize) {
        self.in_use[space.index()].fetch_sub(size, Ordering::AcqRel);
    }
}

const fn primitive_slot(primitive: CopyPrimitive) -> usize {
    match primitive {
        CopyPrimitive::DeviceMemcpy => 0,
        CopyPrimitive::HostDeviceMemcpy => 1,
        CopyPrimitive::HostMemcpy => 2,
    }
}

impl MemoryDriver for SystemDriver {
    fn raw_allocate(&self, space: MemorySpace, size: usize) -> SpaceResult<*mut u8> {
        self.reserve(space, size)?;

        let padded = align_up(size.max(1), self.alignment);
        let mut out: *mut libc::c_void = ptr::null_mut();
        let ret = unsafe { libc::posix_memalign(&raw mut out, self.alignment, padded) };

        if ret != 0 || out.is_null() {
            self.unreserve(space, size);
            return Err(SpaceError::OutOfMemory {
                space,
                requested: size,
            });
        }

        log::trace!("[SystemDriver] {space}: allocated {size} bytes at {out:p}");
        Ok(out.cast::<u8>())
    }

    fn raw_deallocate(&self, space: MemorySpace, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        unsafe { libc::free(ptr.cast()) };
        self.unreserve(space, size);
        log::trace!("[SystemDriver] {space}: released {size} bytes at {ptr:p}");
    }

    fn raw_copy(
        &self,
        primitive: CopyPrimitive,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> SpaceResult<()> {
        self.copies[primitive_slot(primitive)].fetch_add(1, Ordering::AcqRel);
        if n > 0 {
            unsafe { libc::memcpy(dst.cast(), src.cast(), n) };
        }
        Ok(())
    }

    fn raw_copy_async(
        &self,
        primitive: CopyPrimitive,
        ctx: &dyn ExecutionContext,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> SpaceResult<()> {
        self.copies[primitive_slot(primitive)].fetch_add(1, Ordering::AcqRel);

        let dst = SendPtr(dst);
        let src = SendPtr(src.cast_mut());
        ctx.enqueue(Box::new(move || {
            let (dst, src) = (dst.get(), src.get());
            if n > 0 {
                unsafe { libc::memcpy(dst.cast(), src.cast_const().cast(), n) };
            }
        }))
    }

    fn create_texture_handle(
        &self,
        ptr: *mut u8,
        size: usize,
        element_width: usize,
    ) -> SpaceResult<TextureHandle> {
        if ptr.is_null() {
            return Err(SpaceError::Driver(
                "cannot bind a texture to a null allocation".into(),
            ));
        }

        let handle = TextureHandle(self.next_texture.fetch_add(1, Ordering::AcqRel));
        self.textures_created.fetch_add(1, Ordering::AcqRel);
        log::trace!(
            "[SystemDriver] texture {} over {ptr:p} ({} x {element_width} bytes)",
            handle.0,
            size / element_width
        );
        Ok(handle)
    }

    fn destroy_texture_handle(&self, handle: TextureHandle) {
        self.textures_destroyed.fetch_add(1, Ordering::AcqRel);
        log::trace!("[SystemDriver] texture {} destroyed", handle.0);
    }

    fn default_context(&self) -> Arc<dyn ExecutionContext> {
        self.stream.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapacityConfig;

    fn limited(device: usize) -> SystemDriver {
        let config = RuntimeConfig {
            capacity: CapacityConfig {
                device: Some(device),
                ..CapacityConfig::default()
            },
            ..RuntimeConfig::default()
        };
        SystemDriver::new(&config).unwrap()
    }

    #[test]
    fn capacity_is_enforced_and_returned() {
        let driver = limited(1024);

        let a = driver.raw_allocate(MemorySpace::Device, 1000).unwrap();
        let err = driver.raw_allocate(MemorySpace::Device, 100).unwrap_err();
        assert!(matches!(
            err,
            SpaceError::OutOfMemory {
                space: MemorySpace::Device,
                requested: 100
            }
        ));

        driver.raw_deallocate(MemorySpace::Device, a, 1000);
        assert_eq!(driver.bytes_in_use(MemorySpace::Device), 0);

        let b = driver.raw_allocate(MemorySpace::Device, 100).unwrap();
        driver.raw_deallocate(MemorySpace::Device, b, 100);
    }

    #[test]
    fn allocations_are_aligned() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let p = driver.raw_allocate(MemorySpace::Host, 3).unwrap();
        assert_eq!(p as usize % 256, 0);
        driver.raw_deallocate(MemorySpace::Host, p, 3);
    }

    #[test]
    fn async_copy_completes_after_fence() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let src = [7u8; 64];
        let mut dst = [0u8; 64];

        let ctx = driver.default_context();
        driver
            .raw_copy_async(
                CopyPrimitive::DeviceMemcpy,
                ctx.as_ref(),
                dst.as_mut_ptr(),
                src.as_ptr(),
                64,
            )
            .unwrap();
        ctx.fence().unwrap();

        assert_eq!(dst, src);
        assert_eq!(driver.copy_count(CopyPrimitive::DeviceMemcpy), 1);
    }

    #[test]
    fn async_copy_on_dead_stream_is_an_error() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let stream = HostStream::new(MemorySpace::Device).unwrap();
        stream.enqueue(Box::new(|| panic!("kernel fault"))).unwrap();
        assert!(stream.fence().is_err());

        let src = [1u8; 8];
        let mut dst = [0u8; 8];
        let err = driver
            .raw_copy_async(
                CopyPrimitive::DeviceMemcpy,
                &stream,
                dst.as_mut_ptr(),
                src.as_ptr(),
                8,
            )
            .unwrap_err();
        assert!(matches!(err, SpaceError::Driver(_)));
        assert_eq!(dst, [0; 8]);
    }

    #[test]
    fn texture_handles_are_unique() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let mut buf = [0u8; 32];
        let a = driver.create_texture_handle(buf.as_mut_ptr(), 32, 4).unwrap();
        let b = driver.create_texture_handle(buf.as_mut_ptr(), 32, 4).unwrap();
        assert_ne!(a, b);
        assert_eq!(driver.textures_created(), 2);
    }
}
