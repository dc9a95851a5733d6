use crate::space::MemorySpace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Driver Error: {0}")]
    Driver(String),

    #[error("Out of {space} memory (requested {requested} bytes)")]
    OutOfMemory { space: MemorySpace, requested: usize },

    #[error("Access of {len} bytes exceeds {size} byte allocation")]
    OutOfBounds { size: usize, len: usize },

    #[error("Allocation \"{label}\" has already been released")]
    Released { label: String },

    #[error("Texture fetch only supports 4, 8 or 16 byte aliases, got {0}")]
    InvalidAliasWidth(usize),

    #[error("Configuration Error: {0}")]
    Config(String),
}

// A convenient alias
pub type SpaceResult<T> = Result<T, SpaceError>;

/// Terminates the calling task with `msg`.
///
/// Used for logic errors that must never be recovered from: illegal
/// cross-space access and operations on untracked pointers.
#[cold]
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    log::error!("{msg}");
    panic!("{msg}");
}
