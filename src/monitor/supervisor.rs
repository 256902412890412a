//! The fleet control loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::WorkerError;
use crate::fleet::{SupervisedWorker, WorkerId};
use crate::jobs::JobId;
use crate::monitor::health::{self, HealthThresholds, WorkerHealth};
use crate::monitor::retry::{self, RetryState};
use crate::monitor::scaling;
use crate::notify::{Notification, Notifier};
use crate::provision::{Provisioner, WorkerSpec};
use crate::scheduler::SchedulerState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Replacement {
    pub old: WorkerId,
    pub new: WorkerId,
    /// Retry count carried by the replacement.
    pub attempt: u32,
    pub backoff: Duration,
}

/// What one tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub scaled_up: Vec<WorkerId>,
    pub reclaimed: Vec<WorkerId>,
    pub replaced: Vec<Replacement>,
    pub retired: Vec<WorkerId>,
    pub degraded: Vec<WorkerId>,
    pub timed_out: Vec<JobId>,
}

impl TickReport {
    pub fn is_quiet(&self) -> bool {
        self.scaled_up.is_empty()
            && self.reclaimed.is_empty()
            && self.replaced.is_empty()
            && self.retired.is_empty()
            && self.timed_out.is_empty()
    }
}

enum Outcome {
    Healthy,
    Degraded(WorkerId),
    Replaced(Replacement),
    Retired(WorkerId),
    Unrecovered(WorkerId),
}

pub struct FleetHealthMonitor {
    scheduler: Arc<SchedulerState>,
    provisioner: Arc<dyn Provisioner>,
    notifier: Arc<dyn Notifier>,
    config: MonitorConfig,
    thresholds: HealthThresholds,
    /// Used for scale-up; replacements reuse the failed worker's spec.
    default_spec: WorkerSpec,
    retries: RetryState,
}

impl FleetHealthMonitor {
    pub fn new(
        scheduler: Arc<SchedulerState>,
        provisioner: Arc<dyn Provisioner>,
        notifier: Arc<dyn Notifier>,
        config: MonitorConfig,
        default_spec: WorkerSpec,
    ) -> Self {
        Self {
            scheduler,
            provisioner,
            notifier,
            thresholds: HealthThresholds::from(&config),
            config,
            default_spec,
            retries: RetryState::new(),
        }
    }

    pub fn retries(&self) -> &RetryState {
        &self.retries
    }

    /// Provision workers up front, as at startup.
    pub async fn provision(&self, count: usize) -> Vec<WorkerId> {
        if count == 0 {
            return Vec::new();
        }
        match self
            .provisioner
            .request_workers(count, &self.default_spec)
            .await
        {
            Ok(workers) => {
                let mut ids = Vec::with_capacity(workers.len());
                for worker in workers {
                    ids.push(worker.descriptor.id);
                    self.scheduler
                        .register_worker(worker, self.default_spec.clone())
                        .await;
                }
                ids
            }
            Err(e) => {
                error!(count, error = %e, "Failed to provision workers");
                Vec::new()
            }
        }
    }

    /// One pass of the control loop: scale, supervise, sweep timeouts.
    pub async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        self.scale(&mut report).await;
        self.supervise(&mut report).await;
        report.timed_out = self.scheduler.sweep_timeouts(self.config.job_timeout).await;

        // Replacements and timeouts may have freed or added capacity.
        self.scheduler.dispatch_logged().await;

        if report.is_quiet() {
            debug!(degraded = report.degraded.len(), "Monitor tick");
        } else {
            info!(
                scaled_up = report.scaled_up.len(),
                reclaimed = report.reclaimed.len(),
                replaced = report.replaced.len(),
                retired = report.retired.len(),
                timed_out = report.timed_out.len(),
                "Monitor tick"
            );
        }
        report
    }

    /// Shut every worker down, as on process exit.
    pub async fn shutdown_all(&self) {
        let workers = self.scheduler.fleet().supervised().await;
        let timeout = self.config.shutdown_timeout;
        join_all(workers.into_iter().map(|w| async move {
            if let Err(e) = w.control.shutdown(timeout).await {
                warn!(worker_id = %w.descriptor.id, error = %e, "Worker shutdown failed");
            }
        }))
        .await;
    }

    async fn scale(&self, report: &mut TickReport) {
        let fleet = self.scheduler.fleet();
        let queue_len = self.scheduler.queue_depth().await;
        let current = fleet.len().await;

        let wanted = scaling::scale_up_count(
            queue_len,
            self.config.max_queue_length_per_worker,
            current,
            self.config.max_workers,
        );
        if wanted > 0 {
            info!(queue_len, current, wanted, "Scaling up");
            report.scaled_up = self.provision(wanted).await;
            return;
        }

        let idle = fleet.idle_workers(self.config.idle_time_threshold).await;
        let count = scaling::reclaim_count(current, idle.len(), self.config.min_workers);
        for id in idle.into_iter().take(count) {
            self.remove_worker(id, "idle reclaim").await;
            info!(worker_id = %id, "Reclaimed idle worker");
            report.reclaimed.push(id);
        }
    }

    async fn supervise(&self, report: &mut TickReport) {
        let workers = self.scheduler.fleet().supervised().await;
        let outcomes = join_all(workers.into_iter().map(|w| self.supervise_worker(w))).await;

        for outcome in outcomes {
            match outcome {
                Outcome::Healthy => {}
                Outcome::Degraded(id) => report.degraded.push(id),
                Outcome::Replaced(r) => report.replaced.push(r),
                Outcome::Retired(id) => report.retired.push(id),
                Outcome::Unrecovered(id) => {
                    warn!(worker_id = %id, "Worker replacement deferred to next tick");
                }
            }
        }
    }

    async fn supervise_worker(&self, worker: SupervisedWorker) -> Outcome {
        let id = worker.descriptor.id;
        let probe = health::probe(worker.control.as_ref(), self.config.probe_deadline).await;
        let now = Utc::now();

        match health::classify(&worker.descriptor, &probe, &self.thresholds, now) {
            WorkerHealth::Healthy => {
                self.scheduler.fleet().mark_healthy(id, now).await;
                self.retries.reset(id).await;
                Outcome::Healthy
            }
            WorkerHealth::Degraded => {
                debug!(worker_id = %id, error = ?probe.error(), "Worker degraded");
                Outcome::Degraded(id)
            }
            WorkerHealth::Crashed => self.recover(worker, WorkerError::Crashed { id }).await,
            WorkerHealth::Stuck => self.recover(worker, WorkerError::Stuck { id }).await,
        }
    }

    /// Replace a crashed or stuck worker, or retire it once its retries
    /// are spent.
    async fn recover(&self, worker: SupervisedWorker, cause: WorkerError) -> Outcome {
        let id = worker.descriptor.id;
        let mut count = self.retries.lock(id).await;
        let attempts = (*count).max(worker.descriptor.retry_count);

        if attempts >= self.config.max_retries {
            let exhausted = WorkerError::RetriesExhausted {
                id,
                retries: attempts,
            };
            warn!(worker_id = %id, cause = %cause, "{exhausted}");
            self.notifier.publish(Notification::WorkerRetired {
                worker_id: id,
                retries: attempts,
            });
            drop(count);
            self.remove_worker(id, "retries exhausted").await;
            return Outcome::Retired(id);
        }

        let backoff = retry::backoff(self.config.initial_backoff, attempts);
        warn!(worker_id = %id, cause = %cause, attempt = attempts + 1, backoff = ?backoff, "Replacing worker");
        self.notifier.publish(Notification::WorkerFailed {
            worker_id: id,
            reason: cause.to_string(),
            retry_count: attempts,
        });
        tokio::time::sleep(backoff).await;

        if let Err(e) = worker.control.shutdown(self.config.shutdown_timeout).await {
            debug!(worker_id = %id, error = %e, "Shutdown of failed worker errored");
        }

        let replacement = match self.provisioner.request_workers(1, &worker.spec).await {
            Ok(mut workers) => workers.pop(),
            Err(e) => {
                error!(worker_id = %id, error = %e, "Failed to start replacement worker");
                None
            }
        };
        let Some(replacement) = replacement else {
            *count = attempts + 1;
            return Outcome::Unrecovered(id);
        };

        let new_id = replacement.descriptor.id;
        let attempt = attempts + 1;
        self.scheduler
            .register_worker(replacement, worker.spec.clone())
            .await;
        self.scheduler.fleet().set_retry_count(new_id, attempt).await;
        self.retries.set(new_id, attempt).await;
        drop(count);

        self.scheduler.deregister_worker(id, &cause.to_string()).await;
        if let Err(e) = self.provisioner.release_worker(id).await {
            warn!(worker_id = %id, error = %e, "Failed to release worker");
        }
        self.retries.remove(id).await;

        Outcome::Replaced(Replacement {
            old: id,
            new: new_id,
            attempt,
            backoff,
        })
    }

    /// Deregister, stop and release a worker for good.
    async fn remove_worker(&self, id: WorkerId, reason: &str) {
        if let Some(gone) = self.scheduler.deregister_worker(id, reason).await {
            if let Err(e) = gone.control.shutdown(self.config.shutdown_timeout).await {
                debug!(worker_id = %id, error = %e, "Worker shutdown errored");
            }
        }
        if let Err(e) = self.provisioner.release_worker(id).await {
            warn!(worker_id = %id, error = %e, "Failed to release worker");
        }
        self.retries.remove(id).await;
    }
}

/// Spawn the monitor ticker background task.
pub fn spawn_monitor_ticker(
    monitor: Arc<FleetHealthMonitor>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            monitor.tick().await;
        }
    })
}
