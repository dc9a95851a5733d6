pub mod stream;
pub mod system;

use crate::error::SpaceResult;
use crate::space::MemorySpace;
use std::sync::Arc;

/// Opaque read-only fetch handle minted by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// The raw copy routine a deep copy is lowered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyPrimitive {
    /// Copy between allocations that share device placement (direction inferred by the driver).
    DeviceMemcpy,
    /// Copy across the host/device interconnect.
    HostDeviceMemcpy,
    /// Plain copy between host-resident allocations.
    HostMemcpy,
}

/// A unit of work bound to an execution context.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A queue of compute/copy work on one execution space.
pub trait ExecutionContext: Send + Sync {
    /// The memory space whose compute units run this context's work.
    fn space(&self) -> MemorySpace;

    /// Blocks until every task enqueued before this call has completed.
    ///
    /// # Errors
    /// Returns a driver error if the context can no longer run work, in which
    /// case earlier tasks may not have completed.
    fn fence(&self) -> SpaceResult<()>;

    /// Appends `task` to the context. Tasks run in submission order.
    ///
    /// # Errors
    /// Returns a driver error if the context can no longer accept work.
    fn enqueue(&self, task: Task) -> SpaceResult<()>;
}

/// The raw allocation / copy / texture backend.
///
/// Nothing here tracks ownership; that is the registry's job.
pub trait MemoryDriver: Send + Sync {
    /// Allocate `size` bytes in `space`.
    ///
    /// # Errors
    /// Returns [`SpaceError::OutOfMemory`](crate::error::SpaceError::OutOfMemory)
    /// when the request cannot be satisfied.
    fn raw_allocate(&self, space: MemorySpace, size: usize) -> SpaceResult<*mut u8>;

    /// Release memory previously returned by [`raw_allocate`](Self::raw_allocate).
    fn raw_deallocate(&self, space: MemorySpace, ptr: *mut u8, size: usize);

    /// Copy `n` bytes and block until the copy has completed.
    ///
    /// # Errors
    /// Returns a driver error if the copy could not be issued.
    fn raw_copy(
        &self,
        primitive: CopyPrimitive,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> SpaceResult<()>;

    /// Enqueue a copy of `n` bytes on `ctx` and return without waiting for it.
    ///
    /// # Errors
    /// Returns a driver error if the copy could not be enqueued.
    fn raw_copy_async(
        &self,
        primitive: CopyPrimitive,
        ctx: &dyn ExecutionContext,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> SpaceResult<()>;

    /// Create a read-only fetch handle over `[ptr, ptr + size)` with `element_width` byte elements.
    ///
    /// # Errors
    /// Returns a driver error if the handle could not be created.
    fn create_texture_handle(
        &self,
        ptr: *mut u8,
        size: usize,
        element_width: usize,
    ) -> SpaceResult<TextureHandle>;

    /// Release a handle from [`create_texture_handle`](Self::create_texture_handle).
    fn destroy_texture_handle(&self, _handle: TextureHandle) {}

    /// The canonical context. Blocking copies fence it before they run.
    fn default_context(&self) -> Arc<dyn ExecutionContext>;
}

/// Raw pointer that may cross into a task closure.
///
/// The enqueuing side guarantees the pointee outlives the task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendPtr(pub *mut u8);

impl SendPtr {
    // Taking `self` makes closures capture the whole wrapper, not the raw field.
    pub(crate) const fn get(self) -> *mut u8 {
        self.0
    }
}

unsafe impl Send for SendPtr {}
