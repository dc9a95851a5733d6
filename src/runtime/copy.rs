//! Deep-copy dispatch between memory spaces.
//!
//! Every cross-space byte transfer goes through [`deep_copy`] or
//! [`deep_copy_on`]; the path and primitive depend only on the
//! `(destination, source)` space pair.

use crate::driver::{CopyPrimitive, ExecutionContext, MemoryDriver};
use crate::error::{SpaceResult, fatal};
use crate::space::{MemorySpace, Placement, access};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPath {
    /// Within one device-resident space.
    SameDevice,
    /// Between two distinct device-resident spaces.
    CrossDevice,
    HostToDevice,
    DeviceToHost,
    /// Between host-resident spaces.
    HostToHost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyPlan {
    pub path: CopyPath,
    pub primitive: CopyPrimitive,
}

/// Selects the copy path for moving bytes from `src` into `dst`.
///
/// Terminates the task if the matrix has no deep-copy rule for the pair.
#[must_use]
#[track_caller]
pub fn plan(dst: MemorySpace, src: MemorySpace) -> CopyPlan {
    if !access::deepcopy(dst, src) {
        fatal(&format!("no deep copy path from {src} to {dst}"));
    }

    let path = match (dst.placement(), src.placement()) {
        (Placement::DeviceResident, Placement::DeviceResident) if dst == src => {
            CopyPath::SameDevice
        }
        (Placement::DeviceResident, Placement::DeviceResident) => CopyPath::CrossDevice,
        (Placement::DeviceResident, Placement::HostResident) => CopyPath::HostToDevice,
        (Placement::HostResident, Placement::DeviceResident) => CopyPath::DeviceToHost,
        (Placement::HostResident, Placement::HostResident) => CopyPath::HostToHost,
    };

    CopyPlan {
        path,
        primitive: primitive_for(dst, src, path),
    }
}

// Restricted and managed memory share placement with the device, so every pair
// touching them is a device memcpy regardless of direction.
const fn shares_device_placement(space: MemorySpace) -> bool {
    matches!(
        space,
        MemorySpace::RestrictedDevice | MemorySpace::ManagedUnified
    )
}

const fn primitive_for(dst: MemorySpace, src: MemorySpace, path: CopyPath) -> CopyPrimitive {
    if shares_device_placement(dst) || shares_device_placement(src) {
        return CopyPrimitive::DeviceMemcpy;
    }

    match path {
        CopyPath::SameDevice | CopyPath::CrossDevice => CopyPrimitive::DeviceMemcpy,
        CopyPath::HostToDevice | CopyPath::DeviceToHost => CopyPrimitive::HostDeviceMemcpy,
        CopyPath::HostToHost => CopyPrimitive::HostMemcpy,
    }
}

/// Copies `n` bytes from `src` (in `src_space`) to `dst` (in `dst_space`) and
/// blocks until the copy is complete.
///
/// The driver's default context is fenced first, so work already queued there
/// (including [`deep_copy_on`] that context) lands before the bytes are read.
/// Must not be called from a task running on that context.
///
/// # Safety
/// `src` must be valid for `n` byte reads and `dst` for `n` byte writes in
/// their respective spaces, and the ranges must not overlap.
///
/// # Errors
/// Propagates the driver's error if the fence or the copy fails.
pub unsafe fn deep_copy(
    driver: &dyn MemoryDriver,
    dst_space: MemorySpace,
    src_space: MemorySpace,
    dst: *mut u8,
    src: *const u8,
    n: usize,
) -> SpaceResult<()> {
    let plan = plan(dst_space, src_space);

    driver.default_context().fence()?;
    if n == 0 {
        return Ok(());
    }

    log::trace!("deep copy {src_space} -> {dst_space}: {n} bytes via {plan:?}");
    driver.raw_copy(plan.primitive, dst, src, n)
}

/// Fences `ctx`, then enqueues a copy of `n` bytes on it and returns.
///
/// Completion is observed by a later `ctx.fence()`. The fence runs even for an
/// empty copy.
///
/// # Safety
/// Same as [`deep_copy`], and both ranges must stay valid until `ctx` has been
/// fenced after this call.
///
/// # Errors
/// Propagates the context's fence failure or the driver's error if the copy
/// cannot be enqueued.
pub unsafe fn deep_copy_on(
    driver: &dyn MemoryDriver,
    ctx: &dyn ExecutionContext,
    dst_space: MemorySpace,
    src_space: MemorySpace,
    dst: *mut u8,
    src: *const u8,
    n: usize,
) -> SpaceResult<()> {
    let plan = plan(dst_space, src_space);

    ctx.fence()?;
    if n == 0 {
        return Ok(());
    }

    log::trace!(
        "async deep copy {src_space} -> {dst_space} on {}: {n} bytes via {plan:?}",
        ctx.space()
    );
    driver.raw_copy_async(plan.primitive, ctx, dst, src, n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::driver::stream::HostStream;
    use crate::driver::system::SystemDriver;
    use crate::driver::{SendPtr, Task};
    use crate::error::SpaceError;
    use std::time::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use MemorySpace::{Device, Host, ManagedUnified, PinnedHost, RestrictedDevice};

    #[test]
    fn paths_by_placement() {
        assert_eq!(plan(RestrictedDevice, RestrictedDevice).path, CopyPath::SameDevice);
        assert_eq!(plan(RestrictedDevice, Host).path, CopyPath::HostToDevice);
        assert_eq!(plan(Host, RestrictedDevice).path, CopyPath::DeviceToHost);
        assert_eq!(plan(Device, RestrictedDevice).path, CopyPath::CrossDevice);
        assert_eq!(plan(PinnedHost, Host).path, CopyPath::HostToHost);
    }

    #[test]
    fn restricted_and_managed_pairs_use_device_memcpy() {
        for other in MemorySpace::ALL {
            for special in [RestrictedDevice, ManagedUnified] {
                assert_eq!(plan(special, other).primitive, CopyPrimitive::DeviceMemcpy);
                assert_eq!(plan(other, special).primitive, CopyPrimitive::DeviceMemcpy);
            }
        }
    }

    #[test]
    fn host_device_pairs_use_interconnect() {
        assert_eq!(plan(Device, Host).primitive, CopyPrimitive::HostDeviceMemcpy);
        assert_eq!(plan(PinnedHost, Device).primitive, CopyPrimitive::HostDeviceMemcpy);
        assert_eq!(plan(Device, Device).primitive, CopyPrimitive::DeviceMemcpy);
        assert_eq!(plan(Host, PinnedHost).primitive, CopyPrimitive::HostMemcpy);
    }

    struct CountingContext {
        fences: AtomicUsize,
    }

    impl ExecutionContext for CountingContext {
        fn space(&self) -> MemorySpace {
            Device
        }

        fn fence(&self) -> SpaceResult<()> {
            self.fences.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn enqueue(&self, task: Task) -> SpaceResult<()> {
            task();
            Ok(())
        }
    }

    #[test]
    fn empty_async_copy_still_fences() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let ctx = CountingContext {
            fences: AtomicUsize::new(0),
        };

        unsafe {
            deep_copy_on(
                &driver,
                &ctx,
                RestrictedDevice,
                Host,
                std::ptr::null_mut(),
                std::ptr::null(),
                0,
            )
            .unwrap();
        }

        assert_eq!(ctx.fences.load(Ordering::SeqCst), 1);
        assert_eq!(driver.copy_count(CopyPrimitive::DeviceMemcpy), 0);
    }

    #[test]
    fn sync_copy_moves_bytes() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let src: Vec<u8> = (0..=255).collect();
        let mut dst = vec![0u8; 256];

        unsafe {
            deep_copy(&driver, Device, Host, dst.as_mut_ptr(), src.as_ptr(), 256).unwrap();
        }

        assert_eq!(dst, src);
        assert_eq!(driver.copy_count(CopyPrimitive::HostDeviceMemcpy), 1);
    }

    #[test]
    fn sync_copy_waits_for_default_context() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let mut src = vec![0u8; 256];
        let mut dst = vec![0u8; 256];

        let target = SendPtr(src.as_mut_ptr());
        driver
            .default_context()
            .enqueue(Box::new(move || {
                std::thread::sleep(Duration::from_millis(50));
                unsafe { std::ptr::write_bytes(target.get(), 0x42, 256) };
            }))
            .unwrap();

        unsafe {
            deep_copy(&driver, Host, Device, dst.as_mut_ptr(), src.as_ptr(), 256).unwrap();
        }
        assert!(dst.iter().all(|&b| b == 0x42));
    }

    #[test]
    fn async_copy_fails_on_dead_context() {
        let driver = SystemDriver::new(&RuntimeConfig::default()).unwrap();
        let stream = HostStream::new(Device).unwrap();
        stream.enqueue(Box::new(|| panic!("kernel fault"))).unwrap();

        let src = [3u8; 16];
        let mut dst = [0u8; 16];
        let result = unsafe {
            deep_copy_on(
                &driver,
                &stream,
                RestrictedDevice,
                Device,
                dst.as_mut_ptr(),
                src.as_ptr(),
                16,
            )
        };
        assert!(matches!(result, Err(SpaceError::Driver(_))));
        assert_eq!(driver.copy_count(CopyPrimitive::DeviceMemcpy), 0);
    }
}
