//! Unified `Database` trait: document persistence for jobs, quota records
//! and lock leases.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::fleet::WorkerId;
use crate::jobs::{Job, JobId, JobStatus};
use crate::quota::{QuotaRecord, QuotaScope};

/// Filter for `find_jobs`. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub user_id: Option<String>,
    pub worker_id: Option<WorkerId>,
    /// Only jobs whose status is not terminal.
    pub active_only: bool,
    pub limit: Option<usize>,
}

/// Backend-agnostic persistence for the control plane.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Overwrite the stored document of an existing job.
    async fn update_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError>;

    /// Jobs matching `filter`, oldest first.
    async fn find_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;

    // ── Quota records ───────────────────────────────────────────────

    async fn insert_quota(&self, record: &QuotaRecord) -> Result<(), DatabaseError>;

    /// Records for a tenant or user, in creation order.
    async fn find_quotas(&self, scope: &QuotaScope) -> Result<Vec<QuotaRecord>, DatabaseError>;

    /// Atomically decrement `available_num` by `cost` if enough credits remain.
    ///
    /// Returns `false` (and changes nothing) when the record is disabled or short.
    async fn consume_quota(&self, id: Uuid, cost: u32) -> Result<bool, DatabaseError>;

    /// Give `cost` credits back to a record.
    async fn refund_quota(&self, id: Uuid, cost: u32) -> Result<(), DatabaseError>;

    // ── Leases ──────────────────────────────────────────────────────

    /// Take the lease on `key` unless a live lease is held by someone else.
    async fn try_acquire_lease(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Drop the lease on `key` if it is still held with `token`.
    async fn release_lease(&self, key: &str, token: &str) -> Result<bool, DatabaseError>;
}
