//! Persistence layer — libSQL-backed documents for jobs, quotas and leases.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, JobFilter};
