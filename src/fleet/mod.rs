//! Worker fleet: descriptors, registry and dispatch.

pub mod descriptor;
pub mod dispatcher;
pub mod registry;

pub use descriptor::{FormatPair, WorkerDescriptor, WorkerId};
pub use dispatcher::{Assignment, Dispatcher};
pub use registry::{Deregistered, SupervisedWorker, WorkerFleetRegistry};
