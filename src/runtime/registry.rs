use super::copy;
use super::record::{AllocationRecord, DeallocFn, RecordSnapshot};
use super::texture::{self, AliasWidth, TextureAlias};
use crate::driver::{MemoryDriver, TextureHandle};
use crate::error::{SpaceResult, fatal};
use crate::space::MemorySpace;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Table<'a> = RwLockWriteGuard<'a, HashMap<usize, Arc<AllocationRecord>>>;
type Locked<'a> = (Table<'a>, Arc<AllocationRecord>);

/// Reference-counted allocation records for one memory space, keyed by base address.
///
/// Allocate, reallocate, deallocate and retain are serialized on the table's
/// write lock; lookups and enumeration share the read lock.
pub struct AllocationRegistry {
    space: MemorySpace,
    driver: Arc<dyn MemoryDriver>,
    trace: bool,
    records: RwLock<HashMap<usize, Arc<AllocationRecord>>>,
}

impl std::fmt::Debug for AllocationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationRegistry")
            .field("space", &self.space)
            .field("live", &self.len())
            .finish_non_exhaustive()
    }
}

impl AllocationRegistry {
    pub fn new(space: MemorySpace, driver: Arc<dyn MemoryDriver>, trace: bool) -> Self {
        Self {
            space,
            driver,
            trace,
            records: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn space(&self) -> MemorySpace {
        self.space
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<usize, Arc<AllocationRecord>>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Table<'_> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn default_dealloc(&self) -> DeallocFn {
        let driver = self.driver.clone();
        Arc::new(move |space, ptr, size| driver.raw_deallocate(space, ptr, size))
    }

    /// Allocates `size` bytes in this space and tracks them under `label`.
    ///
    /// # Errors
    /// Propagates the driver's failure (typically out of memory).
    pub fn allocate(&self, label: &str, size: usize) -> SpaceResult<*mut u8> {
        self.allocate_with_dealloc(label, size, self.default_dealloc())
    }

    /// Like [`allocate`](Self::allocate), but `dealloc` releases the storage
    /// when the last reference goes away.
    ///
    /// # Errors
    /// Propagates the driver's failure (typically out of memory).
    pub fn allocate_with_dealloc(
        &self,
        label: &str,
        size: usize,
        dealloc: DeallocFn,
    ) -> SpaceResult<*mut u8> {
        let mut records = self.write();

        let ptr = self.driver.raw_allocate(self.space, size)?;
        let record = AllocationRecord::new(self.space, label.to_owned(), ptr, size, dealloc);
        records.insert(ptr as usize, Arc::new(record));
        drop(records);

        if self.trace {
            log::debug!("{}: allocate \"{label}\" {size} bytes at {ptr:p}", self.space);
        }
        Ok(ptr)
    }

    /// Resizes a tracked allocation, keeping its label, space and reference count.
    ///
    /// The first `min(old, new)` bytes are copied, any cached texture handle is
    /// dropped and the old storage is released once the table is unlocked.
    /// Reallocating an untracked pointer is fatal.
    ///
    /// # Errors
    /// Propagates the driver's failure; the record is left untouched in that case.
    #[track_caller]
    pub fn reallocate(&self, ptr: *mut u8, new_size: usize) -> SpaceResult<*mut u8> {
        let records = self.write();
        let locked = self.expect_tracked(records, ptr, "reallocate");
        self.reallocate_locked(locked, new_size)
    }

    /// [`reallocate`](Self::reallocate) addressed by record rather than by its
    /// current pointer. Fatal if the record has been released.
    ///
    /// # Errors
    /// Propagates the driver's failure; the record is left untouched in that case.
    #[track_caller]
    pub fn reallocate_record(
        &self,
        record: &AllocationRecord,
        new_size: usize,
    ) -> SpaceResult<*mut u8> {
        let records = self.write();
        let locked = self.expect_live(records, record, "reallocate");
        self.reallocate_locked(locked, new_size)
    }

    fn reallocate_locked(&self, locked: Locked<'_>, new_size: usize) -> SpaceResult<*mut u8> {
        let (mut records, record) = locked;
        let new_ptr = self.driver.raw_allocate(self.space, new_size)?;

        let mut state = record.lock_state();
        let (old_ptr, old_size) = (state.ptr, state.size);

        let copied = unsafe {
            copy::deep_copy(
                self.driver.as_ref(),
                self.space,
                self.space,
                new_ptr,
                old_ptr,
                old_size.min(new_size),
            )
        };
        if let Err(e) = copied {
            drop(state);
            self.driver.raw_deallocate(self.space, new_ptr, new_size);
            return Err(e);
        }

        let dealloc = state.dealloc.clone();
        let stale = state.texture.take();
        state.ptr = new_ptr;
        state.size = new_size;
        drop(state);

        records.remove(&(old_ptr as usize));
        records.insert(new_ptr as usize, record.clone());
        drop(records);

        // The old storage is unreachable from the table now; user routines may re-enter.
        if let Some(stale) = stale {
            self.driver.destroy_texture_handle(stale.handle);
        }
        if let Some(dealloc) = dealloc {
            dealloc(self.space, old_ptr, old_size);
        }

        if self.trace {
            log::debug!(
                "{}: reallocate \"{}\" {old_ptr:p} ({old_size} bytes) -> {new_ptr:p} ({new_size} bytes)",
                self.space,
                record.label()
            );
        }
        Ok(new_ptr)
    }

    /// Takes an additional reference on a tracked allocation. Fatal if untracked.
    #[track_caller]
    pub fn retain(&self, ptr: *mut u8) -> usize {
        let records = self.write();
        let (records, record) = self.expect_tracked(records, ptr, "retain");
        let count = record.increment();
        drop(records);
        count
    }

    /// [`retain`](Self::retain) addressed by record. Fatal if the record has been released.
    #[track_caller]
    pub fn retain_record(&self, record: &AllocationRecord) -> usize {
        let records = self.write();
        let (records, record) = self.expect_live(records, record, "retain");
        let count = record.increment();
        drop(records);
        count
    }

    /// Drops one reference. When the count reaches zero the record is removed
    /// and its deallocation routine runs. Fatal if `ptr` is untracked.
    #[track_caller]
    pub fn deallocate(&self, ptr: *mut u8) {
        let records = self.write();
        let locked = self.expect_tracked(records, ptr, "deallocate");
        self.deallocate_locked(locked);
    }

    /// [`deallocate`](Self::deallocate) addressed by record, so a concurrent
    /// reallocation cannot move the storage out from under the lookup. Fatal if
    /// the record has already been released.
    #[track_caller]
    pub fn deallocate_record(&self, record: &AllocationRecord) {
        let records = self.write();
        let locked = self.expect_live(records, record, "deallocate");
        self.deallocate_locked(locked);
    }

    fn deallocate_locked(&self, (mut records, record): Locked<'_>) {
        if record.decrement() > 0 {
            return;
        }

        records.remove(&(record.ptr() as usize));
        drop(records);

        self.release(&record);
    }

    #[track_caller]
    fn expect_tracked<'a>(&self, records: Table<'a>, ptr: *mut u8, op: &str) -> Locked<'a> {
        let Some(record) = records.get(&(ptr as usize)).cloned() else {
            drop(records);
            fatal(&format!("{}: {op} of untracked pointer {ptr:p}", self.space));
        };
        (records, record)
    }

    // Reallocation re-keys the table under the write lock, so the record's
    // pointer read here is its current key.
    #[track_caller]
    fn expect_live<'a>(
        &self,
        records: Table<'a>,
        record: &AllocationRecord,
        op: &str,
    ) -> Locked<'a> {
        let key = record.ptr() as usize;
        let Some(found) = records
            .get(&key)
            .filter(|found| std::ptr::eq(Arc::as_ptr(found), record))
            .cloned()
        else {
            drop(records);
            fatal(&format!(
                "{}: {op} of released record \"{}\"",
                self.space,
                record.label()
            ));
        };
        (records, found)
    }

    fn release(&self, record: &AllocationRecord) {
        let mut state = record.lock_state();

        let (ptr, size) = (state.ptr, state.size);
        let stale = state.texture.take();
        let dealloc = state.dealloc.take();
        state.ptr = std::ptr::null_mut();
        state.size = 0;
        drop(state);

        if let Some(tex) = stale {
            self.driver.destroy_texture_handle(tex.handle);
        }
        if let Some(dealloc) = dealloc {
            dealloc(self.space, ptr, size);
        }

        if self.trace {
            log::debug!(
                "{}: release \"{}\" {size} bytes at {ptr:p}",
                self.space,
                record.label()
            );
        }
    }

    /// Looks up the record for `ptr`. Returns `None` for untracked pointers.
    #[must_use]
    pub fn get_record(&self, ptr: *const u8) -> Option<Arc<AllocationRecord>> {
        self.read().get(&(ptr as usize)).cloned()
    }

    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.read().contains_key(&(ptr as usize))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live record, ordered by address.
    #[must_use]
    pub fn enumerate(&self) -> Vec<RecordSnapshot> {
        let mut out: Vec<_> = self.read().values().map(|r| r.snapshot()).collect();
        out.sort_by_key(|s| s.addr);
        out
    }

    /// Attaches (or returns the cached) texture handle for `record`.
    ///
    /// # Errors
    /// Propagates the driver's failure to create the handle.
    pub fn attach_texture<A: TextureAlias>(
        &self,
        record: &AllocationRecord,
    ) -> SpaceResult<TextureHandle> {
        texture::attach::<A>(self.driver.as_ref(), record)
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
        texture::attach_width(self.driver.as_ref(), record, width)
    }
}
