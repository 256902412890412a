//! Job registry: the in-memory view of live jobs, backed by the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StateError;
use crate::fleet::WorkerId;
use crate::jobs::model::{Job, JobId, Progress};
use crate::jobs::state::JobStatus;
use crate::store::{Database, JobFilter};

/// Owns job entities and enforces the state machine on every mutation.
///
/// Every accepted change is written through to the store before it becomes
/// visible here. `Timeout` is never stored as a status: the stored record
/// only gains a `timed_out_at` marker, which keeps it out of recovery and
/// makes store lookups read as `Timeout`.
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
    store: Arc<dyn Database>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Persist a new pending job and start tracking it.
    pub async fn create(&self, job: Job) -> Result<JobId, StateError> {
        let id = job.id;
        self.store.insert_job(&job).await?;
        self.jobs.write().await.insert(id, job);
        debug!(job_id = %id, "Job created");
        Ok(id)
    }

    /// Load non-terminal jobs from the store into the live view.
    pub async fn restore(&self) -> Result<Vec<Job>, StateError> {
        let active = self
            .store
            .find_jobs(&JobFilter {
                active_only: true,
                ..Default::default()
            })
            .await?;
        let mut jobs = self.jobs.write().await;
        for job in &active {
            jobs.insert(job.id, job.clone());
        }
        info!(count = active.len(), "Restored active jobs");
        Ok(active)
    }

    /// Scheduler view of a job, falling back to the stored record.
    pub async fn get(&self, id: JobId) -> Result<Job, StateError> {
        if let Some(job) = self.jobs.read().await.get(&id) {
            return Ok(job.clone());
        }
        self.store
            .get_job(id)
            .await?
            .map(Job::into_view)
            .ok_or(StateError::NotFound { id })
    }

    /// Apply a lifecycle transition.
    ///
    /// `Pending` and `Timeout` are reserved for `reassign` and
    /// `classify_timeout`. A failure reason is kept as the job's error.
    pub async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        reason: Option<String>,
    ) -> Result<Job, StateError> {
        self.mutate(id, |job| {
            if matches!(to, JobStatus::Pending | JobStatus::Timeout) {
                return Err(invalid(job, to));
            }
            if to.is_failed() {
                job.error = reason.clone();
            }
            job.transition_to(to, reason).map_err(|_| invalid(job, to))
        })
        .await
    }

    /// Bind a pending job to a worker and move it to `Start`.
    pub async fn bind(&self, id: JobId, worker: WorkerId) -> Result<Job, StateError> {
        self.mutate(id, |job| {
            job.transition_to(JobStatus::Start, Some(format!("assigned to {worker}")))
                .map_err(|_| invalid(job, JobStatus::Start))?;
            job.worker_id = Some(worker);
            Ok(())
        })
        .await
    }

    /// Return a dispatched job to `Pending` after its worker was lost.
    pub async fn reassign(&self, id: JobId, reason: &str) -> Result<Job, StateError> {
        self.mutate(id, |job| {
            job.transition_to(JobStatus::Pending, Some(reason.to_string()))
                .map_err(|_| invalid(job, JobStatus::Pending))?;
            job.retry_count += 1;
            job.worker_id = None;
            job.progress = Progress::default();
            Ok(())
        })
        .await
    }

    /// Record worker-reported progress on a live job.
    pub async fn record_progress(&self, id: JobId, progress: Progress) -> Result<Job, StateError> {
        self.mutate(id, |job| {
            if job.status.is_terminal() {
                return Err(invalid(job, job.status));
            }
            job.progress = progress;
            job.update_time = Utc::now();
            Ok(())
        })
        .await
    }

    /// Mark a job `Timeout`. The stored record keeps its last persisted
    /// status and only records when the deadline was hit.
    pub async fn classify_timeout(&self, id: JobId) -> Result<Job, StateError> {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&id).ok_or(StateError::NotFound { id })?;

        let mut next = current.clone();
        next.transition_to(JobStatus::Timeout, Some("deadline elapsed".to_string()))
            .map_err(|_| invalid(current, JobStatus::Timeout))?;
        next.timed_out_at = Some(next.update_time);

        let mut stored = current.clone();
        stored.timed_out_at = next.timed_out_at;
        self.store.update_job(&stored).await?;

        jobs.insert(id, next.clone());
        Ok(next)
    }

    /// Live jobs created more than `max_age` ago.
    pub async fn overdue(&self, max_age: Duration) -> Vec<JobId> {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - max_age;
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| !j.status.is_terminal() && j.created_at <= cutoff)
            .map(|j| j.id)
            .collect()
    }

    /// Drop terminal jobs untouched for `older_than` from the live view.
    pub async fn evict_finished(&self, older_than: Duration) -> usize {
        let Ok(older_than) = chrono::Duration::from_std(older_than) else {
            return 0;
        };
        let cutoff = Utc::now() - older_than;
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.update_time <= cutoff));
        before - jobs.len()
    }

    /// All jobs in the live view.
    pub async fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|j| !j.status.is_terminal())
            .count()
    }

    async fn mutate<F>(&self, id: JobId, f: F) -> Result<Job, StateError>
    where
        F: FnOnce(&mut Job) -> Result<(), StateError>,
    {
        let mut jobs = self.jobs.write().await;
        let current = jobs.get(&id).ok_or(StateError::NotFound { id })?;

        let mut next = current.clone();
        f(&mut next)?;
        self.store.update_job(&next).await?;
        jobs.insert(id, next.clone());
        Ok(next)
    }
}

fn invalid(job: &Job, to: JobStatus) -> StateError {
    StateError::InvalidTransition {
        id: job.id,
        from: job.status,
        to,
    }
}
