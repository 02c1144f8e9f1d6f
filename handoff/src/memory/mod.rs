//! Storage that can cross the coordinator/worker boundary without being copied.
//!
//! - **shared**: `SharedRegion`, aliased by every handle, unsynchronized by contract
//! - **owned**: `OwnedBuffer`, exclusively owned and moved across the channel

mod owned;
mod shared;

pub use owned::{BufferError, OwnedBuffer};
pub use shared::{RegionGuard, RegionId, SharedRegion, SyncPolicy};

/// Width of one slot in bytes. Both kinds of storage hold `f64` values.
pub const SLOT_BYTES: usize = std::mem::size_of::<f64>();
