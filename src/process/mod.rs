//! Worker processes and their control channel.

pub mod controller;
pub mod protocol;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::fleet::WorkerId;

pub use controller::{ProcessLaunch, WorkerProcessController};
pub use protocol::{Framing, HealthMetrics};

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    /// The process ignored `shutdown` and was killed.
    pub forced: bool,
}

/// Control surface the scheduler and monitor need from a worker.
#[async_trait]
pub trait WorkerControl: Send + Sync {
    fn id(&self) -> WorkerId;

    /// Liveness probe; `true` only for an affirmative reply.
    async fn check_health(&self) -> Result<bool, WorkerError>;

    async fn get_metrics(&self) -> Result<HealthMetrics, WorkerError>;

    /// `false` once the underlying process has exited or its control
    /// channel is closed.
    async fn is_alive(&self) -> bool;

    /// Ask the worker to stop; force-terminate after `timeout`.
    async fn shutdown(&self, timeout: Duration) -> Result<ExitReport, WorkerError>;
}
