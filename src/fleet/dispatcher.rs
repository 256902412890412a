//! Matches queued jobs to workers.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StateError;
use crate::fleet::descriptor::WorkerId;
use crate::fleet::registry::WorkerFleetRegistry;
use crate::jobs::{JobId, JobRegistry, JobStatus, Priority, PriorityQueues};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub priority: Priority,
}

/// Drains the priority queues onto the fleet.
pub struct Dispatcher {
    jobs: Arc<JobRegistry>,
    fleet: Arc<WorkerFleetRegistry>,
}

impl Dispatcher {
    pub fn new(jobs: Arc<JobRegistry>, fleet: Arc<WorkerFleetRegistry>) -> Self {
        Self { jobs, fleet }
    }

    /// One dispatch pass.
    ///
    /// VIP first. Within a class the head job blocks the rest when no
    /// worker can take it, and Normal is only considered once VIP is empty.
    /// Entries whose job is no longer pending are dropped from the queue.
    pub async fn dispatch(
        &self,
        queues: &mut PriorityQueues,
    ) -> Result<Vec<Assignment>, StateError> {
        let mut assigned = Vec::new();

        for class in [Priority::Vip, Priority::Normal] {
            if class == Priority::Normal && queues.depths().vip > 0 {
                break;
            }

            while let Some(job_id) = queues.front(class) {
                let job = match self.jobs.get(job_id).await {
                    Ok(job) if job.status == JobStatus::Pending => job,
                    Ok(job) => {
                        debug!(job_id = %job_id, status = %job.status, "Dropping stale queue entry");
                        queues.pop_front(class);
                        continue;
                    }
                    Err(StateError::NotFound { .. }) => {
                        queues.pop_front(class);
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let inputs = job.input_formats();
                let outputs = job.output_formats();
                let Some(worker_id) = self.fleet.claim_slot(job_id, &inputs, &outputs).await else {
                    debug!(job_id = %job_id, priority = ?class, "No eligible worker, head of line waits");
                    break;
                };

                match self.jobs.bind(job_id, worker_id).await {
                    Ok(_) => {
                        queues.pop_front(class);
                        debug!(job_id = %job_id, worker_id = %worker_id, "Job dispatched");
                        assigned.push(Assignment {
                            job_id,
                            worker_id,
                            priority: class,
                        });
                    }
                    Err(StateError::InvalidTransition { from, .. }) => {
                        warn!(job_id = %job_id, status = %from, "Job left Pending during dispatch");
                        self.fleet.release_slot(worker_id, job_id).await;
                        queues.pop_front(class);
                    }
                    Err(e) => {
                        self.fleet.release_slot(worker_id, job_id).await;
                        return Err(e);
                    }
                }
            }
        }

        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::descriptor::{FormatPair, WorkerDescriptor};
    use crate::fleet::registry::fakes::FakeWorker;
    use crate::jobs::fixtures;
    use crate::jobs::{Job, OwnerRef};
    use crate::provision::WorkerSpec;
    use crate::store::{Database, LibSqlBackend};
    use uuid::Uuid;

    struct Harness {
        jobs: Arc<JobRegistry>,
        fleet: Arc<WorkerFleetRegistry>,
        dispatcher: Dispatcher,
        queues: PriorityQueues,
    }

    async fn harness() -> Harness {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let jobs = Arc::new(JobRegistry::new(store));
        let fleet = Arc::new(WorkerFleetRegistry::new());
        Harness {
            dispatcher: Dispatcher::new(jobs.clone(), fleet.clone()),
            jobs,
            fleet,
            queues: PriorityQueues::new(),
        }
    }

    impl Harness {
        async fn worker(&self, outputs: &[&str], max_parallel: u32) -> WorkerId {
            let id = Uuid::new_v4();
            let descriptor = WorkerDescriptor::new(
                id,
                "w",
                "fake",
                vec![FormatPair::new(&["step"], outputs)],
                max_parallel,
            );
            self.fleet
                .register(descriptor, FakeWorker::new(id), WorkerSpec::default())
                .await;
            id
        }

        async fn submit(&mut self, formats: &[&str], priority: Priority) -> JobId {
            let job = Job::new(
                fixtures::request(OwnerRef::user("u1"), formats),
                priority,
                String::new(),
            );
            let id = self.jobs.create(job).await.unwrap();
            self.queues.push_back(id, priority);
            id
        }
    }

    #[tokio::test]
    async fn capacity_and_coverage_scenario() {
        let mut h = harness().await;
        let a = h.worker(&["obj", "fbx"], 2).await;

        let j1 = h.submit(&["obj"], Priority::Normal).await;
        let j2 = h.submit(&["fbx"], Priority::Normal).await;
        let j3 = h.submit(&["obj"], Priority::Normal).await;

        let assigned = h.dispatcher.dispatch(&mut h.queues).await.unwrap();
        assert_eq!(assigned.len(), 2);
        assert_eq!(assigned[0].job_id, j1);
        assert_eq!(assigned[1].job_id, j2);
        assert!(assigned.iter().all(|x| x.worker_id == a));
        assert_eq!(h.queues.front(Priority::Normal), Some(j3));
        assert_eq!(h.jobs.get(j3).await.unwrap().status, JobStatus::Pending);
        assert_eq!(h.jobs.get(j1).await.unwrap().status, JobStatus::Start);

        // A job needing a format nobody serves waits behind nothing else.
        let mut h2 = harness().await;
        h2.worker(&["obj", "fbx"], 2).await;
        let stl = h2.submit(&["stl"], Priority::Normal).await;
        assert!(h2.dispatcher.dispatch(&mut h2.queues).await.unwrap().is_empty());
        assert!(h2.queues.contains(stl));
    }

    #[tokio::test]
    async fn vip_is_dispatched_before_normal() {
        let mut h = harness().await;
        h.worker(&["obj"], 1).await;
        let normal = h.submit(&["obj"], Priority::Normal).await;
        let vip = h.submit(&["obj"], Priority::Vip).await;

        let assigned = h.dispatcher.dispatch(&mut h.queues).await.unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].job_id, vip);
        assert_eq!(h.queues.front(Priority::Normal), Some(normal));
    }

    #[tokio::test]
    async fn blocked_vip_holds_back_normal() {
        let mut h = harness().await;
        h.worker(&["obj"], 2).await;
        let vip = h.submit(&["stl"], Priority::Vip).await;
        h.submit(&["obj"], Priority::Normal).await;

        let assigned = h.dispatcher.dispatch(&mut h.queues).await.unwrap();
        assert!(assigned.is_empty());
        assert_eq!(h.queues.front(Priority::Vip), Some(vip));
        assert_eq!(h.queues.len(), 2);
    }

    #[tokio::test]
    async fn head_of_line_blocks_within_class() {
        let mut h = harness().await;
        h.worker(&["obj"], 2).await;
        let blocked = h.submit(&["stl"], Priority::Normal).await;
        h.submit(&["obj"], Priority::Normal).await;

        assert!(h.dispatcher.dispatch(&mut h.queues).await.unwrap().is_empty());
        assert_eq!(h.queues.front(Priority::Normal), Some(blocked));
    }

    #[tokio::test]
    async fn stale_entries_are_dropped() {
        let mut h = harness().await;
        h.worker(&["obj"], 1).await;
        let canceled = h.submit(&["obj"], Priority::Normal).await;
        let live = h.submit(&["obj"], Priority::Normal).await;
        h.jobs
            .transition(canceled, JobStatus::Canceling, None)
            .await
            .unwrap();

        let assigned = h.dispatcher.dispatch(&mut h.queues).await.unwrap();
        assert_eq!(assigned.len(), 1);
        assert_eq!(assigned[0].job_id, live);
        assert!(h.queues.is_empty());
    }
}
