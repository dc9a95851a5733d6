use super::copy;
use super::record::{AllocationRecord, DeallocFn, RecordSnapshot};
use super::registry::AllocationRegistry;
use super::texture::{AliasWidth, TextureAlias};
use crate::config::RuntimeConfig;
use crate::driver::system::SystemDriver;
use crate::driver::{ExecutionContext, MemoryDriver, TextureHandle};
use crate::error::{SpaceError, SpaceResult, fatal};
use crate::space::MemorySpace;
use crate::utils::format_bytes;
use std::fmt::Write;
use std::sync::{Arc, Mutex, PoisonError};

/// One driver plus an allocation registry per memory space.
pub struct MemoryRuntime {
    config: RuntimeConfig,
    driver: Arc<dyn MemoryDriver>,
    registries: [AllocationRegistry; MemorySpace::COUNT],
}

impl std::fmt::Debug for MemoryRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRuntime")
            .field("config", &self.config)
            .field("registries", &self.registries)
            .finish_non_exhaustive()
    }
}

impl MemoryRuntime {
    pub fn new(driver: Arc<dyn MemoryDriver>, config: RuntimeConfig) -> Self {
        let registries = MemorySpace::ALL
            .map(|space| AllocationRegistry::new(space, driver.clone(), config.trace_allocations));

        Self {
            config,
            driver,
            registries,
        }
    }

    /// Builds a runtime on the host-backed [`SystemDriver`].
    ///
    /// # Errors
    /// Returns an error if the driver's default stream cannot be started.
    pub fn with_system_driver(config: RuntimeConfig) -> SpaceResult<Self> {
        let driver = Arc::new(SystemDriver::new(&config)?);
        Ok(Self::new(driver, config))
    }

    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn driver(&self) -> &Arc<dyn MemoryDriver> {
        &self.driver
    }

    #[must_use]
    pub const fn registry(&self, space: MemorySpace) -> &AllocationRegistry {
        &self.registries[space.index()]
    }

    fn owner_of(&self, ptr: *const u8) -> Option<&AllocationRegistry> {
        self.registries.iter().find(|r| r.contains(ptr))
    }

    #[track_caller]
    fn expect_owner(&self, ptr: *const u8, op: &str) -> &AllocationRegistry {
        self.owner_of(ptr)
            .unwrap_or_else(|| fatal(&format!("{op} of untracked pointer {ptr:p}")))
    }

    /// Allocates tracked memory in `space`.
    ///
    /// # Errors
    /// Propagates the driver's failure (typically out of memory).
    pub fn allocate(&self, space: MemorySpace, label: &str, size: usize) -> SpaceResult<*mut u8> {
        self.registry(space).allocate(label, size)
    }

    /// Allocates tracked memory released by `dealloc` instead of the driver.
    ///
    /// # Errors
    /// Propagates the driver's failure (typically out of memory).
    pub fn allocate_with_dealloc(
        &self,
        space: MemorySpace,
        label: &str,
        size: usize,
        dealloc: DeallocFn,
    ) -> SpaceResult<*mut u8> {
        self.registry(space).allocate_with_dealloc(label, size, dealloc)
    }

    /// Resizes a tracked allocation in whichever space owns it. Fatal if untracked.
    ///
    /// # Errors
    /// Propagates the driver's failure to allocate the new storage.
    #[track_caller]
    pub fn reallocate(&self, ptr: *mut u8, size: usize) -> SpaceResult<*mut u8> {
        self.expect_owner(ptr, "reallocate").reallocate(ptr, size)
    }

    /// Drops one reference to a tracked allocation. Fatal if untracked.
    #[track_caller]
    pub fn deallocate(&self, ptr: *mut u8) {
        self.expect_owner(ptr, "deallocate").deallocate(ptr);
    }

    /// Adds one reference to a tracked allocation. Fatal if untracked.
    #[track_caller]
    pub fn retain(&self, ptr: *mut u8) -> usize {
        self.expect_owner(ptr, "retain").retain(ptr)
    }

    /// [`retain`](Self::retain) by record identity, independent of concurrent reallocation.
    #[track_caller]
    pub fn retain_record(&self, record: &AllocationRecord) -> usize {
        self.registry(record.space()).retain_record(record)
    }

    /// [`deallocate`](Self::deallocate) by record identity. Fatal if already released.
    #[track_caller]
    pub fn deallocate_record(&self, record: &AllocationRecord) {
        self.registry(record.space()).deallocate_record(record);
    }

    /// [`reallocate`](Self::reallocate) by record identity. Fatal if already released.
    ///
    /// # Errors
    /// Propagates the driver's failure to allocate the new storage.
    #[track_caller]
    pub fn reallocate_record(
        &self,
        record: &AllocationRecord,
        size: usize,
    ) -> SpaceResult<*mut u8> {
        self.registry(record.space()).reallocate_record(record, size)
    }

    /// Non-fatal lookup across every space.
    #[must_use]
    pub fn get_record(&self, ptr: *const u8) -> Option<Arc<AllocationRecord>> {
        self.registries.iter().find_map(|r| r.get_record(ptr))
    }

    #[must_use]
    pub fn enumerate(&self, space: MemorySpace) -> Vec<RecordSnapshot> {
        self.registry(space).enumerate()
    }

    /// Renders the live records of `space`, one per line.
    ///
    /// With `detail`, the record id, reference count and texture handle are included.
    #[must_use]
    pub fn report(&self, space: MemorySpace, detail: bool) -> String {
        let records = self.enumerate(space);
        let total: usize = records.iter().map(|r| r.size).sum();

        let mut out = format!(
            "{space}: {} live allocation(s), {}\n",
            records.len(),
            format_bytes(total)
        );
        for record in &records {
            if detail {
                let _ = writeln!(out, "  #{} {record}", record.id.value());
            } else {
                let _ = writeln!(
                    out,
                    "  0x{:012x} {:>12} \"{}\"",
                    record.addr,
                    format_bytes(record.size),
                    record.label
                );
            }
        }
        out
    }

    /// Returns the texture handle cached on `record`, creating it on first use.
    ///
    /// # Errors
    /// Returns [`SpaceError::Released`] for a record whose storage is gone, or
    /// the driver's failure to create the handle.
    pub fn attach_texture<A: TextureAlias>(
        &self,
        record: &AllocationRecord,
    ) -> SpaceResult<TextureHandle> {
        self.registry(record.space()).attach_texture::<A>(record)
    }

    /// Width-erased [`attach_texture`](Self::attach_texture).
    ///
    /// # Errors
    /// Propagates the driver's failure to create the handle.
    pub fn attach_texture_width(
        &self,
        record: &AllocationRecord,
        width: AliasWidth,
    ) -> SpaceResult<TextureHandle> {
        self.registry(record.space()).attach_texture_width(record, width)
    }

    /// Blocking deep copy through this runtime's driver, ordered after work
    /// already queued on the driver's default context.
    ///
    /// # Safety
    /// See [`copy::deep_copy`].
    ///
    /// # Errors
    /// Propagates the default context's fence failure or the driver's copy failure.
    pub unsafe fn deep_copy(
        &self,
        dst_space: MemorySpace,
        src_space: MemorySpace,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> SpaceResult<()> {
        unsafe { copy::deep_copy(self.driver.as_ref(), dst_space, src_space, dst, src, n) }
    }

    /// Fenced asynchronous deep copy on `ctx`.
    ///
    /// # Safety
    /// See [`copy::deep_copy_on`].
    ///
    /// # Errors
    /// Propagates the driver's failure to enqueue the copy.
    pub unsafe fn deep_copy_on(
        &self,
        ctx: &dyn ExecutionContext,
        dst_space: MemorySpace,
        src_space: MemorySpace,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> SpaceResult<()> {
        unsafe {
            copy::deep_copy_on(
                self.driver.as_ref(),
                ctx,
                dst_space,
                src_space,
                dst,
                src,
                n,
            )
        }
    }

    /// [`deep_copy_on`](Self::deep_copy_on) the driver's default context.
    ///
    /// # Safety
    /// See [`copy::deep_copy_on`].
    ///
    /// # Errors
    /// Propagates the driver's failure to enqueue the copy.
    pub unsafe fn deep_copy_async(
        &self,
        dst_space: MemorySpace,
        src_space: MemorySpace,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> SpaceResult<()> {
        let ctx = self.driver.default_context();
        unsafe { self.deep_copy_on(ctx.as_ref(), dst_space, src_space, dst, src, n) }
    }

    /// Copies `data` from host memory into the start of the tracked allocation at `ptr`.
    ///
    /// # Errors
    /// Returns [`SpaceError::OutOfBounds`] if `data` does not fit the allocation.
    #[track_caller]
    pub fn write_from_host(&self, ptr: *mut u8, data: &[u8]) -> SpaceResult<()> {
        let record = self.expect_record(ptr, "write");
        check_bounds(&record, data.len())?;

        unsafe {
            self.deep_copy(
                record.space(),
                MemorySpace::Host,
                ptr,
                data.as_ptr(),
                data.len(),
            )
        }
    }

    /// Copies the start of the tracked allocation at `ptr` into `out`.
    ///
    /// # Errors
    /// Returns [`SpaceError::OutOfBounds`] if `out` is larger than the allocation.
    #[track_caller]
    pub fn read_to_host(&self, ptr: *const u8, out: &mut [u8]) -> SpaceResult<()> {
        let record = self.expect_record(ptr, "read");
        check_bounds(&record, out.len())?;

        unsafe {
            self.deep_copy(
                MemorySpace::Host,
                record.space(),
                out.as_mut_ptr(),
                ptr,
                out.len(),
            )
        }
    }

    #[track_caller]
    fn expect_record(&self, ptr: *const u8, op: &str) -> Arc<AllocationRecord> {
        self.get_record(ptr)
            .unwrap_or_else(|| fatal(&format!("{op} of untracked pointer {ptr:p}")))
    }
}

fn check_bounds(record: &AllocationRecord, len: usize) -> SpaceResult<()> {
    let size = record.size();
    if len > size {
        return Err(SpaceError::OutOfBounds { size, len });
    }
    Ok(())
}

// ===============================================================================================
// Global Singleton Management
// ===============================================================================================

static GLOBAL_RUNTIME: Mutex<Option<Arc<MemoryRuntime>>> = Mutex::new(None);

/// Returns the process-wide runtime, creating it on first use.
///
/// The first call reads `memspace.toml` (see [`RuntimeConfig::from_current_dir`]),
/// applies environment overrides and starts a [`SystemDriver`].
///
/// # Errors
/// Returns an error if the driver cannot be started.
pub fn acquire() -> SpaceResult<Arc<MemoryRuntime>> {
    let mut guard = GLOBAL_RUNTIME.lock().unwrap_or_else(PoisonError::into_inner);

    if let Some(runtime) = guard.as_ref() {
        return Ok(runtime.clone());
    }

    let config = RuntimeConfig::from_current_dir().override_from_env();
    let runtime = Arc::new(MemoryRuntime::with_system_driver(config)?);

    *guard = Some(runtime.clone());
    drop(guard);

    Ok(runtime)
}

/// Installs `runtime` as the process-wide runtime, replacing any previous one.
pub fn install(runtime: Arc<MemoryRuntime>) {
    *GLOBAL_RUNTIME.lock().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
}

/// Drops the process-wide runtime. Live `Arc`s handed out earlier stay valid.
pub fn release() {
    let previous = GLOBAL_RUNTIME
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();

    if let Some(runtime) = previous {
        for space in MemorySpace::ALL {
            let live = runtime.registry(space).len();
            if live > 0 {
                log::warn!("releasing runtime with {live} live allocation(s) in {space}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn runtime() -> MemoryRuntime {
        MemoryRuntime::with_system_driver(RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn pointer_lookup_spans_spaces() {
        let rt = runtime();
        let host = rt.allocate(MemorySpace::Host, "h", 8).unwrap();
        let dev = rt.allocate(MemorySpace::RestrictedDevice, "d", 8).unwrap();

        assert_eq!(rt.get_record(host).unwrap().space(), MemorySpace::Host);
        assert_eq!(
            rt.get_record(dev).unwrap().space(),
            MemorySpace::RestrictedDevice
        );

        rt.deallocate(host);
        rt.deallocate(dev);
        assert!(rt.get_record(host).is_none());
        assert!(rt.get_record(dev).is_none());
    }

    #[test]
    #[should_panic(expected = "deallocate of untracked pointer")]
    fn untracked_deallocate_is_fatal() {
        runtime().deallocate(0x4000 as *mut u8);
    }

    #[test]
    fn out_of_bounds_write_is_rejected() {
        let rt = runtime();
        let ptr = rt.allocate(MemorySpace::Device, "small", 4).unwrap();
        let err = rt.write_from_host(ptr, &[0; 8]).unwrap_err();
        assert!(matches!(err, SpaceError::OutOfBounds { size: 4, len: 8 }));
        rt.deallocate(ptr);
    }

    #[test]
    fn async_copy_on_default_context() {
        let rt = runtime();
        let src = rt.allocate(MemorySpace::Host, "src", 64).unwrap();
        let dst = rt.allocate(MemorySpace::Device, "dst", 64).unwrap();
        rt.write_from_host(src, &[9; 64]).unwrap();

        unsafe {
            rt.deep_copy_async(MemorySpace::Device, MemorySpace::Host, dst, src, 64)
                .unwrap();
        }
        rt.driver().default_context().fence().unwrap();

        let mut out = [0u8; 64];
        rt.read_to_host(dst, &mut out).unwrap();
        assert_eq!(out, [9; 64]);

        rt.deallocate(src);
        rt.deallocate(dst);
    }

    #[test]
    fn report_lists_records() {
        let rt = runtime();
        let ptr = rt.allocate(MemorySpace::PinnedHost, "staging", 2048).unwrap();

        let brief = rt.report(MemorySpace::PinnedHost, false);
        assert!(brief.starts_with("PinnedHostSpace: 1 live allocation(s), 2.00 KiB\n"));
        assert!(brief.contains("\"staging\""));

        let detail = rt.report(MemorySpace::PinnedHost, true);
        assert!(detail.contains("rc=1"));

        rt.deallocate(ptr);
        assert_eq!(
            rt.report(MemorySpace::PinnedHost, false),
            "PinnedHostSpace: 0 live allocation(s), 0 B\n"
        );
    }

    #[test]
    #[serial]
    fn acquire_returns_shared_runtime() {
        release();
        let a = acquire().unwrap();
        let b = acquire().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        release();
        let c = acquire().unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        release();
    }

    #[test]
    #[serial]
    fn install_replaces_runtime() {
        let custom = Arc::new(runtime());
        install(custom.clone());
        assert!(Arc::ptr_eq(&acquire().unwrap(), &custom));
        release();
    }
}
