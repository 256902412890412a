//! Error types for the conversion control plane.

use std::time::Duration;

use uuid::Uuid;

use crate::fleet::WorkerId;
use crate::jobs::JobStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Infrastructure error: {0}")]
    Infra(#[from] InfraError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },
}

/// Store-level errors. Surfaced to the core as `InfraError::PersistenceUnavailable`.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors returned synchronously by `AdmissionController::accept`.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Duplicate request (fingerprint {fingerprint})")]
    DuplicateRequest { fingerprint: String },

    #[error("Too many queued jobs ({depth}/{limit}), try again later")]
    QueueFull { depth: usize, limit: usize },

    #[error("Target format {format} is not supported for this owner")]
    FormatNotSupported { format: String },

    #[error("Conversion quota exhausted")]
    QuotaExceeded,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Infra(#[from] InfraError),
}

/// Job state machine errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Job {id} in state {from} cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Worker {worker} no longer holds job {id}")]
    StaleReport { id: Uuid, worker: WorkerId },

    #[error(transparent)]
    Infra(#[from] InfraError),
}

/// Worker supervision and control-channel errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Worker {id} crashed")]
    Crashed { id: WorkerId },

    #[error("Worker {id} is stuck")]
    Stuck { id: WorkerId },

    #[error("Worker {id} did not answer {command} within {timeout:?}")]
    ProbeTimeout {
        id: WorkerId,
        command: String,
        timeout: Duration,
    },

    #[error("Worker {id} retired after {retries} retries")]
    RetriesExhausted { id: WorkerId, retries: u32 },

    #[error("Failed to spawn worker process {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Control channel of worker {id} closed")]
    ChannelClosed { id: WorkerId },

    #[error("Protocol error from worker {id}: {reason}")]
    Protocol { id: WorkerId, reason: String },

    #[error("Worker {id} speaks protocol v{got}, expected v{expected}")]
    ProtocolMismatch {
        id: WorkerId,
        expected: u32,
        got: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collaborator failures. Propagated, never recovered, by the core.
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    #[error("Lock service unavailable: {0}")]
    LockUnavailable(String),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("Provisioner failed: {0}")]
    ProvisionerFailed(String),
}

impl From<DatabaseError> for InfraError {
    fn from(e: DatabaseError) -> Self {
        InfraError::PersistenceUnavailable(e.to_string())
    }
}

impl From<DatabaseError> for StateError {
    fn from(e: DatabaseError) -> Self {
        StateError::Infra(e.into())
    }
}

impl From<DatabaseError> for AdmissionError {
    fn from(e: DatabaseError) -> Self {
        AdmissionError::Infra(e.into())
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
