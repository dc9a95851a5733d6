pub mod context;
pub mod copy;
pub mod record;
pub mod registry;
pub mod texture;
pub mod tracker;

// Re-export the main entry points for easy access
pub use context::{MemoryRuntime, acquire, install, release};
pub use record::{AllocationRecord, DeallocFn, RecordId, RecordSnapshot};
pub use registry::AllocationRegistry;
pub use tracker::TrackedBuffer;
