//! Admission: dedup, backpressure, format and quota checks, enqueue.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, InfraError, StateError};
use crate::jobs::{ConversionRequest, Job, Priority};
use crate::lock::{DistributedLock, new_token};
use crate::notify::{Notification, Notifier};
use crate::quota::{QuotaLedger, UserType};
use crate::scheduler::SchedulerState;

/// Deterministic SHA-256 of the request's canonical JSON.
///
/// Object keys serialize in sorted order, so equal requests hash equally
/// regardless of how they were built.
pub fn fingerprint(request: &ConversionRequest) -> Result<String, AdmissionError> {
    let canonical = serde_json::to_value(request)
        .and_then(|v| serde_json::to_vec(&v))
        .map_err(|e| AdmissionError::InvalidRequest(e.to_string()))?;
    Ok(format!("{:x}", Sha256::digest(&canonical)))
}

pub struct AdmissionController {
    scheduler: Arc<SchedulerState>,
    lock: Arc<dyn DistributedLock>,
    ledger: Arc<dyn QuotaLedger>,
    notifier: Arc<dyn Notifier>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(
        scheduler: Arc<SchedulerState>,
        lock: Arc<dyn DistributedLock>,
        ledger: Arc<dyn QuotaLedger>,
        notifier: Arc<dyn Notifier>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            scheduler,
            lock,
            ledger,
            notifier,
            config,
        }
    }

    /// Admit a request as a new pending job.
    ///
    /// The dedup lock on the fingerprint is held for the whole admission
    /// and released whatever the outcome. A queue place is reserved before
    /// quota is charged, so concurrent admissions cannot overfill the queue.
    pub async fn accept(&self, request: ConversionRequest) -> Result<Job, AdmissionError> {
        let fingerprint = fingerprint(&request)?;
        let key = format!("dedup:{fingerprint}");
        let token = new_token();

        if !self
            .lock
            .acquire(&key, &token, self.config.dedup_ttl)
            .await?
        {
            debug!(fingerprint = %fingerprint, "Duplicate request rejected");
            return Err(AdmissionError::DuplicateRequest { fingerprint });
        }

        let result = self.admit(request, fingerprint).await;

        if let Err(e) = self.lock.release(&key, &token).await {
            warn!(key = %key, error = %e, "Failed to release dedup lock");
        }

        if result.is_ok() {
            self.scheduler.dispatch_logged().await;
        }
        result
    }

    async fn admit(
        &self,
        request: ConversionRequest,
        fingerprint: String,
    ) -> Result<Job, AdmissionError> {
        validate(&request)?;

        let reservation = match self.scheduler.reserve(self.config.queue_hard_limit).await {
            Ok(reservation) => reservation,
            Err(depth) => {
                warn!(depth, limit = self.config.queue_hard_limit, "Queue full, rejecting");
                return Err(AdmissionError::QueueFull {
                    depth,
                    limit: self.config.queue_hard_limit,
                });
            }
        };
        let depth = reservation.depth();
        if depth + 1 > self.config.queue_pressure_threshold {
            self.raise_pressure(depth + 1).await;
        }

        let owner = &request.owner;
        let allowed = self.ledger.list_allowed_formats(owner).await?;
        if !allowed.is_empty() {
            if let Some(format) = request
                .output_formats()
                .into_iter()
                .find(|f| !allowed.contains(f))
            {
                return Err(AdmissionError::FormatNotSupported { format });
            }
        }

        if !self
            .ledger
            .check_and_consume(owner, self.config.job_cost)
            .await?
        {
            info!(owner = %owner, "Quota exceeded");
            return Err(AdmissionError::QuotaExceeded);
        }

        let priority = match self.ledger.user_type(owner).await {
            Ok(UserType::Vip) => Priority::Vip,
            Ok(UserType::Normal) => Priority::Normal,
            Err(e) => {
                warn!(owner = %owner, error = %e, "User type lookup failed, using normal priority");
                Priority::Normal
            }
        };

        let owner = owner.clone();
        let job = Job::new(request, priority, fingerprint);
        let id = job.id;
        if let Err(e) = self.scheduler.submit_reserved(job.clone(), reservation).await {
            if let Err(refund) = self.ledger.refund(&owner, self.config.job_cost).await {
                warn!(owner = %owner, error = %refund, "Refund after failed submit failed");
            }
            return Err(match e {
                StateError::Infra(infra) => AdmissionError::Infra(infra),
                other => AdmissionError::Infra(InfraError::PersistenceUnavailable(other.to_string())),
            });
        }

        info!(job_id = %id, owner = %owner, priority = priority.as_str(), "Job admitted");
        Ok(job)
    }

    /// Queue pressure alert, at most once per cooldown per deployment.
    async fn raise_pressure(&self, depth: usize) {
        let key = format!("queue-pressure:{}", self.config.deployment);
        match self
            .lock
            .acquire(&key, &new_token(), self.config.pressure_cooldown)
            .await
        {
            Ok(true) => self.notifier.publish(Notification::QueuePressure {
                deployment: self.config.deployment.clone(),
                depth,
                threshold: self.config.queue_pressure_threshold,
            }),
            Ok(false) => debug!(depth, "Queue pressure alert in cooldown"),
            Err(e) => warn!(error = %e, "Queue pressure cooldown unavailable"),
        }
    }
}

fn validate(request: &ConversionRequest) -> Result<(), AdmissionError> {
    if request.owner.user_id.trim().is_empty() {
        return Err(AdmissionError::InvalidRequest("owner user_id is empty".into()));
    }
    if request.target_formats.is_empty() {
        return Err(AdmissionError::InvalidRequest("no target formats".into()));
    }
    if let Some(t) = request.target_formats.iter().find(|t| t.name.trim().is_empty()) {
        return Err(AdmissionError::InvalidRequest(format!(
            "target format with tag '{}' has no name",
            t.tag
        )));
    }
    if request.transformable_files().next().is_none() {
        return Err(AdmissionError::InvalidRequest("no transformable files".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::jobs::{JobStatus, OwnerRef, TargetFormat, fixtures};
    use crate::lock::StoreLock;
    use crate::quota::{QuotaRecord, QuotaScope, StoreQuotaLedger};
    use crate::scheduler::testing::{TestScheduler, scheduler};
    use crate::store::Database;

    struct Harness {
        t: TestScheduler,
        admission: Arc<AdmissionController>,
    }

    async fn harness(config: AdmissionConfig) -> Harness {
        let t = scheduler().await;
        let ledger = Arc::new(StoreQuotaLedger::new(t.store.clone()));
        let admission = Arc::new(AdmissionController::new(
            t.state.clone(),
            Arc::new(StoreLock::new(t.store.clone())),
            ledger,
            t.notifier.clone(),
            config,
        ));
        Harness { t, admission }
    }

    /// Distinct request per `n` so fingerprints differ.
    fn request(user: &str, n: usize) -> ConversionRequest {
        let mut r = fixtures::request(OwnerRef::user(user), &["obj"]);
        r.marks = vec![format!("req-{n}")];
        r
    }

    #[test]
    fn fingerprint_is_stable_and_discriminating() {
        let a = request("u1", 0);
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&a.clone()).unwrap());
        assert_eq!(fingerprint(&a).unwrap().len(), 64);
        assert_ne!(
            fingerprint(&a).unwrap(),
            fingerprint(&request("u2", 0)).unwrap()
        );
    }

    #[tokio::test]
    async fn admitted_job_is_pending_and_queued() {
        let h = harness(AdmissionConfig::default()).await;
        let job = h.admission.accept(request("u1", 0)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(h.t.state.queue_depth().await, 1);
        assert!(h.t.store.get_job(job.id).await.unwrap().is_some());

        // The lock is released, so an identical retry is accepted.
        assert!(h.admission.accept(request("u1", 0)).await.is_ok());
    }

    /// Ledger that parks the first consume until released.
    struct GatedLedger {
        inner: StoreQuotaLedger,
        entered: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl QuotaLedger for GatedLedger {
        async fn check_and_consume(
            &self,
            owner: &crate::jobs::OwnerRef,
            cost: u32,
        ) -> Result<bool, InfraError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.check_and_consume(owner, cost).await
        }

        async fn list_allowed_formats(
            &self,
            owner: &crate::jobs::OwnerRef,
        ) -> Result<Vec<String>, InfraError> {
            self.inner.list_allowed_formats(owner).await
        }

        async fn user_type(&self, owner: &crate::jobs::OwnerRef) -> Result<UserType, InfraError> {
            self.inner.user_type(owner).await
        }

        async fn refund(&self, owner: &crate::jobs::OwnerRef, cost: u32) -> Result<(), InfraError> {
            self.inner.refund(owner, cost).await
        }
    }

    #[tokio::test]
    async fn concurrent_duplicates_admit_exactly_one() {
        let t = scheduler().await;
        let ledger = Arc::new(GatedLedger {
            inner: StoreQuotaLedger::new(t.store.clone()),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let admission = Arc::new(AdmissionController::new(
            t.state.clone(),
            Arc::new(StoreLock::new(t.store.clone())),
            ledger.clone(),
            t.notifier.clone(),
            AdmissionConfig::default(),
        ));

        let first = tokio::spawn({
            let admission = admission.clone();
            async move { admission.accept(request("u1", 7)).await }
        });
        ledger.entered.notified().await;

        let second = admission.accept(request("u1", 7)).await;
        assert!(matches!(second, Err(AdmissionError::DuplicateRequest { .. })));

        ledger.gate.notify_one();
        let first = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap();
        assert!(first.is_ok());
        assert_eq!(t.state.queue_depth().await, 1);
    }

    #[tokio::test]
    async fn concurrent_admissions_respect_queue_limit() {
        let t = scheduler().await;
        let ledger = Arc::new(GatedLedger {
            inner: StoreQuotaLedger::new(t.store.clone()),
            entered: Notify::new(),
            gate: Notify::new(),
        });
        let admission = Arc::new(AdmissionController::new(
            t.state.clone(),
            Arc::new(StoreLock::new(t.store.clone())),
            ledger.clone(),
            t.notifier.clone(),
            AdmissionConfig {
                queue_hard_limit: 2,
                ..AdmissionConfig::default()
            },
        ));
        t.state
            .submit(Job::new(request("u0", 0), Priority::Normal, String::new()))
            .await
            .unwrap();

        // The first admission holds the last place while it is charged.
        let first = tokio::spawn({
            let admission = admission.clone();
            async move { admission.accept(request("u1", 1)).await }
        });
        ledger.entered.notified().await;

        let second = admission.accept(request("u2", 2)).await;
        assert!(matches!(
            second,
            Err(AdmissionError::QueueFull { depth: 2, limit: 2 })
        ));

        ledger.gate.notify_one();
        let first = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap();
        assert!(first.is_ok());
        assert_eq!(t.state.queue_depth().await, 2);

        // Canceling a queued job frees its place.
        t.state.cancel(first.unwrap().id).await.unwrap();
        let third = tokio::spawn({
            let admission = admission.clone();
            async move { admission.accept(request("u3", 3)).await }
        });
        ledger.entered.notified().await;
        ledger.gate.notify_one();
        assert!(third.await.unwrap().is_ok());
        assert_eq!(t.state.queue_depth().await, 2);
    }

    #[tokio::test]
    async fn quota_admits_exactly_n() {
        let h = harness(AdmissionConfig::default()).await;
        let record = QuotaRecord::new(QuotaScope::User("u1".into()), 3);
        h.t.store.insert_quota(&record).await.unwrap();

        let mut accepted = 0;
        for n in 0..5 {
            match h.admission.accept(request("u1", n)).await {
                Ok(_) => accepted += 1,
                Err(AdmissionError::QuotaExceeded) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!(accepted, 3);
        let stored = h.t.store.find_quotas(&record.scope).await.unwrap();
        assert_eq!(stored[0].available_num, 0);
    }

    #[tokio::test]
    async fn concurrent_admissions_never_overspend_quota() {
        let h = harness(AdmissionConfig::default()).await;
        let record = QuotaRecord::new(QuotaScope::User("u1".into()), 4);
        h.t.store.insert_quota(&record).await.unwrap();

        let tasks: Vec<_> = (0..10)
            .map(|n| {
                let admission = h.admission.clone();
                tokio::spawn(async move { admission.accept(request("u1", n)).await })
            })
            .collect();
        let mut accepted = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 4);
        let stored = h.t.store.find_quotas(&record.scope).await.unwrap();
        assert_eq!(stored[0].available_num, 0);
    }

    #[tokio::test]
    async fn vip_owner_goes_to_vip_queue() {
        let h = harness(AdmissionConfig::default()).await;
        let mut record = QuotaRecord::new(QuotaScope::User("vip".into()), 10);
        record.user_type = UserType::Vip;
        h.t.store.insert_quota(&record).await.unwrap();

        let job = h.admission.accept(request("vip", 0)).await.unwrap();
        assert_eq!(job.priority, Priority::Vip);
        assert_eq!(h.t.state.depths().await.vip, 1);
    }

    #[tokio::test]
    async fn disallowed_format_is_rejected_without_charge() {
        let h = harness(AdmissionConfig::default()).await;
        let mut record = QuotaRecord::new(QuotaScope::User("u1".into()), 5);
        record.allowed_formats = vec!["FBX".into()];
        h.t.store.insert_quota(&record).await.unwrap();

        let err = h.admission.accept(request("u1", 0)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::FormatNotSupported { ref format } if format == "obj"));

        let mut fbx = request("u1", 1);
        fbx.target_formats = vec![TargetFormat::named("fbx")];
        assert!(h.admission.accept(fbx).await.is_ok());
        let stored = h.t.store.find_quotas(&record.scope).await.unwrap();
        assert_eq!(stored[0].available_num, 4);
    }

    #[tokio::test]
    async fn malformed_requests_are_invalid() {
        let h = harness(AdmissionConfig::default()).await;

        let mut no_formats = request("u1", 0);
        no_formats.target_formats.clear();
        let mut no_files = request("u1", 1);
        for f in &mut no_files.folder_config {
            f.transform = false;
        }
        let no_owner = request("", 2);

        for bad in [no_formats, no_files, no_owner] {
            let err = h.admission.accept(bad).await.unwrap_err();
            assert!(matches!(err, AdmissionError::InvalidRequest(_)));
        }
        assert_eq!(h.t.state.queue_depth().await, 0);
    }

    #[tokio::test]
    async fn pressure_alert_once_then_queue_full() {
        let h = harness(AdmissionConfig {
            queue_pressure_threshold: 5,
            queue_hard_limit: 10,
            ..AdmissionConfig::default()
        })
        .await;
        let mut rx = h.t.notifier.subscribe();

        for n in 0..10 {
            h.admission.accept(request("u1", n)).await.unwrap();
        }
        let err = h.admission.accept(request("u1", 10)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull { depth: 10, limit: 10 }));

        let mut alerts = Vec::new();
        while let Ok(n) = rx.try_recv() {
            if let Notification::QueuePressure { depth, .. } = n {
                alerts.push(depth);
            }
        }
        assert_eq!(alerts, vec![6]);
    }

    #[tokio::test]
    async fn default_thresholds_alert_at_501_and_reject_1001() {
        let h = harness(AdmissionConfig::default()).await;
        let mut rx = h.t.notifier.subscribe();

        for n in 0..500 {
            h.admission.accept(request("u1", n)).await.unwrap();
        }
        assert!(rx.try_recv().is_err());

        for n in 500..1000 {
            h.admission.accept(request("u1", n)).await.unwrap();
        }
        let err = h.admission.accept(request("u1", 1000)).await.unwrap_err();
        assert!(matches!(err, AdmissionError::QueueFull { .. }));

        let mut alerts = 0;
        while let Ok(n) = rx.try_recv() {
            if matches!(n, Notification::QueuePressure { depth: 501, .. }) {
                alerts += 1;
            } else {
                panic!("unexpected notification {n:?}");
            }
        }
        assert_eq!(alerts, 1);
    }
}
