//! handoff: copy, shared-memory and ownership-transfer exchange between a
//! coordinator and an isolated worker.

mod slot;

pub mod bridge;
pub mod coordinator;
pub mod memory;
pub mod worker;

pub use bridge::protocol::{Mode, ProtocolError, Request, Response};
pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorError, PendingResponse};
pub use memory::{BufferError, OwnedBuffer, RegionId, SharedRegion, SyncPolicy};
pub use worker::{
    Doubling, Transform, WorkerConfig, WorkerError, WorkerHandle, WorkerStats, run_worker,
    spawn_worker,
};
