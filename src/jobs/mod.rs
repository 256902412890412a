//! Conversion jobs.
//!
//! - `model` — Job entity and request types
//! - `state` — Job status machine (Pending → Start → Download → Processing → ...)
//! - `queue` — Priority FIFOs of pending job ids
//! - `registry` — Live job view with write-through persistence

pub mod model;
pub mod queue;
pub mod registry;
pub mod state;

#[cfg(test)]
pub(crate) use model::fixtures;
pub use model::{
    ConversionRequest, FolderConfig, Job, JobId, OwnerRef, Priority, Progress, TargetFormat,
    UploadEntry,
};
pub use queue::{PriorityQueues, QueueDepths};
pub use registry::JobRegistry;
pub use state::{JobStatus, StateTransition};
