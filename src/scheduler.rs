//! Scheduler state: the single handle owning live jobs, the priority
//! queues and the worker fleet.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::StateError;
use crate::fleet::{Assignment, Deregistered, Dispatcher, WorkerFleetRegistry, WorkerId};
use crate::jobs::{Job, JobId, JobRegistry, JobStatus, PriorityQueues, Progress, QueueDepths};
use crate::notify::{Notification, Notifier};
use crate::provision::{ProvisionedWorker, WorkerSpec};
use crate::quota::QuotaLedger;
use crate::store::Database;

/// A worker's report about one job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProgressReport {
    /// Reporting worker. Reports from a worker the job is no longer bound
    /// to are rejected.
    pub worker_id: Option<WorkerId>,
    pub status: Option<JobStatus>,
    pub progress: Option<Progress>,
    pub error: Option<String>,
}

/// A queue place held by an admission still in progress. Dropping it gives
/// the place back.
pub struct QueueReservation {
    reserved: Arc<AtomicUsize>,
    depth: usize,
}

impl QueueReservation {
    /// Queued plus reserved jobs ahead of this one.
    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for QueueReservation {
    fn drop(&mut self) {
        self.reserved.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SchedulerState {
    jobs: Arc<JobRegistry>,
    fleet: Arc<WorkerFleetRegistry>,
    queues: Mutex<PriorityQueues>,
    reserved: Arc<AtomicUsize>,
    dispatcher: Dispatcher,
    ledger: Arc<dyn QuotaLedger>,
    notifier: Arc<dyn Notifier>,
    job_cost: u32,
}

impl SchedulerState {
    pub fn new(
        store: Arc<dyn Database>,
        ledger: Arc<dyn QuotaLedger>,
        notifier: Arc<dyn Notifier>,
        job_cost: u32,
    ) -> Self {
        let jobs = Arc::new(JobRegistry::new(store));
        let fleet = Arc::new(WorkerFleetRegistry::new());
        Self {
            dispatcher: Dispatcher::new(jobs.clone(), fleet.clone()),
            jobs,
            fleet,
            queues: Mutex::new(PriorityQueues::new()),
            reserved: Arc::new(AtomicUsize::new(0)),
            ledger,
            notifier,
            job_cost,
        }
    }

    pub fn jobs(&self) -> &Arc<JobRegistry> {
        &self.jobs
    }

    pub fn fleet(&self) -> &Arc<WorkerFleetRegistry> {
        &self.fleet
    }

    pub async fn queue_depth(&self) -> usize {
        self.queues.lock().await.len()
    }

    pub async fn depths(&self) -> QueueDepths {
        self.queues.lock().await.depths()
    }

    /// Hold a queue place if queued plus reserved jobs are below `limit`.
    /// Returns the current depth when the queue is full.
    pub async fn reserve(&self, limit: usize) -> Result<QueueReservation, usize> {
        let queues = self.queues.lock().await;
        let depth = queues.len() + self.reserved.load(Ordering::SeqCst);
        if depth >= limit {
            return Err(depth);
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(QueueReservation {
            reserved: Arc::clone(&self.reserved),
            depth,
        })
    }

    /// Submit into a place taken with `reserve`.
    pub async fn submit_reserved(
        &self,
        job: Job,
        reservation: QueueReservation,
    ) -> Result<JobId, StateError> {
        let result = self.submit(job).await;
        drop(reservation);
        result
    }

    /// Persist a new pending job and append it to its priority queue.
    pub async fn submit(&self, job: Job) -> Result<JobId, StateError> {
        let priority = job.priority;
        let id = self.jobs.create(job).await?;
        self.queues.lock().await.push_back(id, priority);
        Ok(id)
    }

    /// Run one dispatch pass.
    pub async fn dispatch(&self) -> Result<Vec<Assignment>, StateError> {
        let mut queues = self.queues.lock().await;
        let assigned = self.dispatcher.dispatch(&mut queues).await?;
        if !assigned.is_empty() {
            info!(count = assigned.len(), remaining = queues.len(), "Dispatched jobs");
        }
        Ok(assigned)
    }

    /// Dispatch pass whose failure is only logged.
    pub async fn dispatch_logged(&self) {
        if let Err(e) = self.dispatch().await {
            error!(error = %e, "Dispatch pass failed");
        }
    }

    /// Apply a worker's progress or status report.
    ///
    /// A terminal report on a `Canceling` job finalizes it as `Canceled`.
    /// Reaching a terminal status frees the worker slot and triggers a
    /// dispatch pass; failed statuses refund quota and raise an alert.
    pub async fn report(&self, id: JobId, report: ProgressReport) -> Result<Job, StateError> {
        let current = self.jobs.get(id).await?;
        if let Some(worker) = report.worker_id {
            if current.worker_id != Some(worker) {
                warn!(job_id = %id, worker_id = %worker, "Report from stale worker ignored");
                return Err(StateError::StaleReport { id, worker });
            }
        }

        if let Some(progress) = report.progress {
            self.jobs.record_progress(id, progress).await?;
            if let Some(worker) = current.worker_id {
                self.fleet
                    .record_progress(worker, progress.percent_complete)
                    .await;
            }
        }

        let Some(status) = report.status else {
            return self.jobs.get(id).await;
        };
        if status == current.status {
            return self.jobs.get(id).await;
        }

        let target = if current.status == JobStatus::Canceling && status.is_terminal() {
            JobStatus::Canceled
        } else {
            status
        };
        let job = self.jobs.transition(id, target, report.error).await?;
        debug!(job_id = %id, status = %job.status, "Job status reported");

        if job.status.is_terminal() {
            self.finish(&job).await;
            self.dispatch_logged().await;
        }
        Ok(job)
    }

    /// Cooperative cancel. A queued job is finalized at once; a dispatched
    /// one waits in `Canceling` for its worker.
    pub async fn cancel(&self, id: JobId) -> Result<Job, StateError> {
        {
            let mut queues = self.queues.lock().await;
            if queues.remove(id) {
                self.jobs
                    .transition(id, JobStatus::Canceling, Some("canceled while queued".into()))
                    .await?;
                let job = self.jobs.transition(id, JobStatus::Canceled, None).await?;
                info!(job_id = %id, "Queued job canceled");
                return Ok(job);
            }
        }

        let job = self
            .jobs
            .transition(id, JobStatus::Canceling, Some("cancel requested".into()))
            .await?;
        if job.worker_id.is_none() {
            return self.jobs.transition(id, JobStatus::Canceled, None).await;
        }
        info!(job_id = %id, worker_id = ?job.worker_id, "Cancel requested");
        Ok(job)
    }

    pub async fn register_worker(&self, worker: ProvisionedWorker, spec: WorkerSpec) {
        self.fleet
            .register(worker.descriptor, worker.control, spec)
            .await;
    }

    /// Remove a worker and hand its in-flight jobs back to the queues.
    ///
    /// Reassigned jobs go to the head of their class; jobs already being
    /// canceled are finalized instead.
    pub async fn deregister_worker(&self, worker: WorkerId, reason: &str) -> Option<Deregistered> {
        let gone = self.fleet.deregister(worker).await?;

        let mut queues = self.queues.lock().await;
        for job_id in gone.jobs.iter().rev().copied() {
            let job = match self.jobs.get(job_id).await {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Cannot load job of removed worker");
                    continue;
                }
            };
            let outcome = if job.status == JobStatus::Canceling {
                self.jobs
                    .transition(job_id, JobStatus::Canceled, Some(reason.to_string()))
                    .await
                    .map(|_| ())
            } else if job.status.is_dispatched() {
                self.jobs.reassign(job_id, reason).await.map(|job| {
                    queues.push_front(job_id, job.priority);
                })
            } else {
                Ok(())
            };
            match outcome {
                Ok(()) => debug!(job_id = %job_id, worker_id = %worker, "In-flight job handled"),
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to reassign job"),
            }
        }
        Some(gone)
    }

    /// Classify live jobs older than `job_timeout` as `Timeout` and free
    /// their slots. Stored records are left as they are.
    pub async fn sweep_timeouts(&self, job_timeout: Duration) -> Vec<JobId> {
        let mut timed_out = Vec::new();
        for id in self.jobs.overdue(job_timeout).await {
            self.queues.lock().await.remove(id);
            match self.jobs.classify_timeout(id).await {
                Ok(job) => {
                    if let Some(worker) = job.worker_id {
                        self.fleet.release_slot(worker, id).await;
                    }
                    warn!(job_id = %id, "Job timed out");
                    timed_out.push(id);
                }
                Err(e) => debug!(job_id = %id, error = %e, "Timeout classification skipped"),
            }
        }
        let evicted = self.jobs.evict_finished(job_timeout).await;
        if evicted > 0 {
            debug!(evicted, "Evicted finished jobs from live view");
        }
        timed_out
    }

    /// Rebuild the queues from stored jobs after a restart. Jobs that were
    /// dispatched to workers of the previous run are reassigned.
    pub async fn recover(&self) -> Result<usize, StateError> {
        let restored = self.jobs.restore().await?;
        let mut queues = self.queues.lock().await;
        let mut requeued = 0;
        for job in restored {
            match job.status {
                JobStatus::Pending => {
                    queues.push_back(job.id, job.priority);
                    requeued += 1;
                }
                JobStatus::Canceling => {
                    self.jobs
                        .transition(job.id, JobStatus::Canceled, Some("restart".into()))
                        .await?;
                }
                status if status.is_dispatched() => {
                    self.jobs.reassign(job.id, "restart").await?;
                    queues.push_back(job.id, job.priority);
                    requeued += 1;
                }
                _ => {}
            }
        }
        info!(requeued, "Scheduler state recovered");
        Ok(requeued)
    }

    async fn finish(&self, job: &Job) {
        if let Some(worker) = job.worker_id {
            self.fleet.release_slot(worker, job.id).await;
        }
        if job.status.is_failed() {
            if let Err(e) = self.ledger.refund(&job.owner, self.job_cost).await {
                error!(job_id = %job.id, error = %e, "Quota refund failed");
            }
            self.notifier.publish(Notification::JobFailed {
                job_id: job.id,
                owner: job.owner.clone(),
                status: job.status,
                error: job.error.clone(),
            });
        }
    }
}

/// Spawn the periodic dispatch background task.
pub fn spawn_dispatch_ticker(
    scheduler: Arc<SchedulerState>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            scheduler.dispatch_logged().await;
        }
    })
}
