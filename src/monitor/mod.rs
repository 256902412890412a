//! Fleet health monitoring, scaling and worker recovery.

pub mod health;
pub mod retry;
pub mod scaling;
pub mod supervisor;

pub use health::{HealthThresholds, WorkerHealth};
pub use retry::RetryState;
pub use supervisor::{FleetHealthMonitor, Replacement, TickReport, spawn_monitor_ticker};
