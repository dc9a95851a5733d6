//! Lazily attached read-only fetch handles over tracked allocations.
//!
//! A record gets at most one texture handle. It spans the whole allocation and
//! is bound to a single element width, chosen by the first caller.
//!
//! Only 32-bit words and their 2- and 4-wide vectors can be fetched. Other
//! element types are rejected when the program is compiled:
//!
//! ```compile_fail
//! use memspace_rs::runtime::texture::TextureAlias;
//!
//! fn width<A: TextureAlias>() -> usize {
//!     A::WIDTH.bytes()
//! }
//!
//! let _ = width::<[i32; 3]>();
//! ```

use super::record::AllocationRecord;
use crate::driver::{MemoryDriver, TextureHandle};
use crate::error::{SpaceError, SpaceResult};

/// Element width a texture handle is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasWidth {
    Word = 4,
    DoubleWord = 8,
    QuadWord = 16,
}

impl AliasWidth {
    #[must_use]
    pub const fn bytes(self) -> usize {
        self as usize
    }
}

impl TryFrom<usize> for AliasWidth {
    type Error = SpaceError;

    fn try_from(bytes: usize) -> SpaceResult<Self> {
        match bytes {
            4 => Ok(Self::Word),
            8 => Ok(Self::DoubleWord),
            16 => Ok(Self::QuadWord),
            other => Err(SpaceError::InvalidAliasWidth(other)),
        }
    }
}

/// Two packed 32-bit integers.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Int2 {
    pub x: i32,
    pub y: i32,
}

/// Four packed 32-bit integers.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Int4 {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub w: i32,
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for i32 {}
    impl Sealed for super::Int2 {}
    impl Sealed for super::Int4 {}
}

/// Element types a texture handle may alias. Sealed.
pub trait TextureAlias: sealed::Sealed + Copy {
    const WIDTH: AliasWidth;
}

impl TextureAlias for i32 {
    const WIDTH: AliasWidth = AliasWidth::Word;
}

impl TextureAlias for Int2 {
    const WIDTH: AliasWidth = AliasWidth::DoubleWord;
}

impl TextureAlias for Int4 {
    const WIDTH: AliasWidth = AliasWidth::QuadWord;
}

const _: () = assert!(size_of::<Int2>() == AliasWidth::DoubleWord.bytes());
const _: () = assert!(size_of::<Int4>() == AliasWidth::QuadWord.bytes());

/// A handle together with the width it was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureObject {
    pub handle: TextureHandle,
    pub width: AliasWidth,
}

/// Returns the record's texture handle, creating it on first use.
///
/// # Errors
/// Propagates the driver's error if the handle cannot be created.
pub fn attach<A: TextureAlias>(
    driver: &dyn MemoryDriver,
    record: &AllocationRecord,
) -> SpaceResult<TextureHandle> {
    attach_width(driver, record, A::WIDTH)
}

/// Width-erased form of [`attach`].
///
/// The record's lock is held across creation, so concurrent first callers
/// produce a single handle and everyone else adopts it.
///
/// # Errors
/// Returns [`SpaceError::Released`] once the record's storage is gone, or the
/// driver's error if the handle cannot be created.
pub fn attach_width(
    driver: &dyn MemoryDriver,
    record: &AllocationRecord,
    width: AliasWidth,
) -> SpaceResult<TextureHandle> {
    let mut state = record.lock_state();
    if state.is_released() {
        return Err(released(record));
    }

    if let Some(existing) = state.texture {
        if existing.width != width {
            log::warn!(
                "texture for \"{}\" is bound to {} byte elements, ignoring request for {}",
                record.label(),
                existing.width.bytes(),
                width.bytes()
            );
        }
        return Ok(existing.handle);
    }

    let handle = driver.create_texture_handle(state.ptr, state.size, width.bytes())?;
    state.texture = Some(TextureObject { handle, width });
    drop(state);

    log::debug!(
        "attached texture {} to \"{}\" ({} byte elements)",
        handle.0,
        record.label(),
        width.bytes()
    );
    Ok(handle)
}

/// Element index of `ptr` inside the record's allocation, in units of `A`.
///
/// Only meaningful for pointers inside the allocation.
///
/// # Errors
/// Returns [`SpaceError::Released`] once the record's storage is gone.
#[allow(clippy::cast_possible_wrap)]
pub fn offset_of<A: TextureAlias>(
    record: &AllocationRecord,
    ptr: *const A,
) -> SpaceResult<isize> {
    let state = record.lock_state();
    if state.is_released() {
        return Err(released(record));
    }
    let base = state.ptr as isize;
    Ok((ptr as isize - base) / A::WIDTH.bytes() as isize)
}

fn released(record: &AllocationRecord) -> SpaceError {
    SpaceError::Released {
        label: record.label().to_owned(),
    }
}
