//! Memory-space bookkeeping for heterogeneous host/accelerator systems.
//!
//! * [`space`]: the memory spaces, the accessibility matrix between them and
//!   the execution-access guard.
//! * [`driver`]: the contracts this crate needs from a device backend, plus a
//!   host-backed reference implementation.
//! * [`runtime`]: reference-counted allocation records, texture handles and
//!   deep-copy dispatch.

pub mod config;
pub mod driver;
pub mod error;
pub mod runtime;
pub mod space;
pub mod utils;

pub use error::{SpaceError, SpaceResult};
pub use space::MemorySpace;
