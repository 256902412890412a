//! Registry of live workers and their capacity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::fleet::descriptor::{WorkerDescriptor, WorkerId};
use crate::jobs::JobId;
use crate::process::WorkerControl;
use crate::provision::WorkerSpec;

struct FleetEntry {
    descriptor: WorkerDescriptor,
    control: Arc<dyn WorkerControl>,
    spec: WorkerSpec,
    jobs: HashSet<JobId>,
}

/// A worker handed to the monitor for supervision.
#[derive(Clone)]
pub struct SupervisedWorker {
    pub descriptor: WorkerDescriptor,
    pub control: Arc<dyn WorkerControl>,
    pub spec: WorkerSpec,
}

/// What was removed by `deregister`.
pub struct Deregistered {
    pub descriptor: WorkerDescriptor,
    pub control: Arc<dyn WorkerControl>,
    pub spec: WorkerSpec,
    /// Jobs that were bound to the worker.
    pub jobs: Vec<JobId>,
}

/// Tracks worker descriptors.
///
/// Slot selection and the `current_parallel` change happen under one write
/// lock, so two dispatchers can never overfill a worker.
#[derive(Default)]
pub struct WorkerFleetRegistry {
    workers: RwLock<HashMap<WorkerId, FleetEntry>>,
}

impl WorkerFleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        descriptor: WorkerDescriptor,
        control: Arc<dyn WorkerControl>,
        spec: WorkerSpec,
    ) {
        let id = descriptor.id;
        info!(worker_id = %id, name = %descriptor.name, max_parallel = descriptor.max_parallel, "Worker registered");
        self.workers.write().await.insert(
            id,
            FleetEntry {
                descriptor,
                control,
                spec,
                jobs: HashSet::new(),
            },
        );
    }

    /// Remove a worker. Its bound jobs are returned for reassignment.
    pub async fn deregister(&self, id: WorkerId) -> Option<Deregistered> {
        let entry = self.workers.write().await.remove(&id)?;
        info!(worker_id = %id, in_flight = entry.jobs.len(), "Worker deregistered");
        let mut jobs: Vec<JobId> = entry.jobs.into_iter().collect();
        jobs.sort();
        Some(Deregistered {
            descriptor: entry.descriptor,
            control: entry.control,
            spec: entry.spec,
            jobs,
        })
    }

    /// Pick the least-loaded worker able to run a job with these formats
    /// and take one of its slots.
    ///
    /// Ties on load ratio go to the earliest `last_healthy_time`.
    pub async fn claim_slot(
        &self,
        job: JobId,
        inputs: &[String],
        outputs: &[String],
    ) -> Option<WorkerId> {
        let mut workers = self.workers.write().await;
        let entry = workers
            .values_mut()
            .filter(|e| e.descriptor.can_accept(inputs, outputs))
            .min_by(|a, b| {
                a.descriptor
                    .load_ratio()
                    .total_cmp(&b.descriptor.load_ratio())
                    .then(a.descriptor.last_healthy_time.cmp(&b.descriptor.last_healthy_time))
            })?;

        entry.descriptor.current_parallel += 1;
        entry.descriptor.idle_since = None;
        entry.jobs.insert(job);
        debug!(
            worker_id = %entry.descriptor.id,
            job_id = %job,
            current = entry.descriptor.current_parallel,
            max = entry.descriptor.max_parallel,
            "Slot claimed"
        );
        Some(entry.descriptor.id)
    }

    /// Give back the slot a job held. Releasing the last one starts the
    /// worker's idle clock.
    pub async fn release_slot(&self, worker: WorkerId, job: JobId) -> bool {
        let mut workers = self.workers.write().await;
        let Some(entry) = workers.get_mut(&worker) else {
            return false;
        };
        if !entry.jobs.remove(&job) {
            return false;
        }
        entry.descriptor.current_parallel = entry.descriptor.current_parallel.saturating_sub(1);
        if entry.descriptor.current_parallel == 0 {
            entry.descriptor.idle_since = Some(Utc::now());
        }
        debug!(worker_id = %worker, job_id = %job, "Slot released");
        true
    }

    /// Healthy check: refresh `last_healthy_time` and clear the retry count.
    pub async fn mark_healthy(&self, id: WorkerId, at: DateTime<Utc>) {
        if let Some(entry) = self.workers.write().await.get_mut(&id) {
            entry.descriptor.last_healthy_time = at;
            entry.descriptor.retry_count = 0;
        }
    }

    pub async fn record_progress(&self, id: WorkerId, percent: f64) {
        if let Some(entry) = self.workers.write().await.get_mut(&id) {
            entry.descriptor.last_progress_time = Utc::now();
            entry.descriptor.progress_percent = percent;
        }
    }

    pub async fn set_retry_count(&self, id: WorkerId, retry_count: u32) {
        if let Some(entry) = self.workers.write().await.get_mut(&id) {
            entry.descriptor.retry_count = retry_count;
        }
    }

    pub async fn get(&self, id: WorkerId) -> Option<WorkerDescriptor> {
        self.workers
            .read()
            .await
            .get(&id)
            .map(|e| e.descriptor.clone())
    }

    pub async fn control(&self, id: WorkerId) -> Option<Arc<dyn WorkerControl>> {
        self.workers.read().await.get(&id).map(|e| e.control.clone())
    }

    /// Descriptors ordered by registration time.
    pub async fn snapshot(&self) -> Vec<WorkerDescriptor> {
        let mut all: Vec<_> = self
            .workers
            .read()
            .await
            .values()
            .map(|e| e.descriptor.clone())
            .collect();
        all.sort_by_key(|d| d.registered_at);
        all
    }

    pub async fn supervised(&self) -> Vec<SupervisedWorker> {
        let mut all: Vec<_> = self
            .workers
            .read()
            .await
            .values()
            .map(|e| SupervisedWorker {
                descriptor: e.descriptor.clone(),
                control: e.control.clone(),
                spec: e.spec.clone(),
            })
            .collect();
        all.sort_by_key(|w| w.descriptor.registered_at);
        all
    }

    /// Workers idle longer than `threshold`, idle-longest first.
    pub async fn idle_workers(&self, threshold: Duration) -> Vec<WorkerId> {
        let now = Utc::now();
        let mut idle: Vec<_> = self
            .workers
            .read()
            .await
            .values()
            .filter(|e| e.descriptor.idle_longer_than(threshold, now))
            .map(|e| (e.descriptor.idle_since, e.descriptor.id))
            .collect();
        idle.sort();
        idle.into_iter().map(|(_, id)| id).collect()
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.workers.read().await.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::WorkerError;
    use crate::process::{ExitReport, HealthMetrics};

    /// Scriptable in-memory worker.
    pub struct FakeWorker {
        pub id: WorkerId,
        pub alive: AtomicBool,
        pub healthy: AtomicBool,
        pub metrics: Mutex<HealthMetrics>,
        pub probe_delay: Mutex<Option<Duration>>,
        /// Next command times out and closes the control channel.
        pub hang_up: AtomicBool,
        pub channel_closed: AtomicBool,
        pub shutdowns: AtomicUsize,
    }

    impl FakeWorker {
        pub fn new(id: WorkerId) -> Arc<Self> {
            Arc::new(Self {
                id,
                alive: AtomicBool::new(true),
                healthy: AtomicBool::new(true),
                metrics: Mutex::new(HealthMetrics {
                    cpu_usage: 10.0,
                    memory_usage: 10.0,
                }),
                probe_delay: Mutex::new(None),
                hang_up: AtomicBool::new(false),
                channel_closed: AtomicBool::new(false),
                shutdowns: AtomicUsize::new(0),
            })
        }

        pub fn crash(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }

        pub fn set_metrics(&self, cpu: f64, memory: f64) {
            *self.metrics.lock().unwrap() = HealthMetrics {
                cpu_usage: cpu,
                memory_usage: memory,
            };
        }

        async fn exchange(&self, command: &str) -> Result<(), WorkerError> {
            if self.channel_closed.load(Ordering::SeqCst) {
                return Err(WorkerError::ChannelClosed { id: self.id });
            }
            if self.hang_up.swap(false, Ordering::SeqCst) {
                self.channel_closed.store(true, Ordering::SeqCst);
                return Err(WorkerError::ProbeTimeout {
                    id: self.id,
                    command: command.to_string(),
                    timeout: Duration::ZERO,
                });
            }
            let delay = *self.probe_delay.lock().unwrap();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl WorkerControl for FakeWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        async fn check_health(&self) -> Result<bool, WorkerError> {
            self.exchange("check_health").await?;
            Ok(self.healthy.load(Ordering::SeqCst))
        }

        async fn get_metrics(&self) -> Result<HealthMetrics, WorkerError> {
            self.exchange("get_metrics").await?;
            Ok(*self.metrics.lock().unwrap())
        }

        async fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn shutdown(&self, _timeout: Duration) -> Result<ExitReport, WorkerError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(ExitReport {
                code: Some(0),
                forced: false,
            })
        }
    }
}
