//! Convert Fleet — control plane for 3D model conversion workers.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod fleet;
pub mod jobs;
pub mod lock;
pub mod monitor;
pub mod notify;
pub mod process;
pub mod provision;
pub mod quota;
pub mod scheduler;
pub mod store;

pub use error::{Error, Result};
