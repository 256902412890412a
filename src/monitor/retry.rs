//! Per-worker retry bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::fleet::WorkerId;

/// Retry counters keyed by worker id, each behind its own lock.
///
/// A counter follows a worker lineage: when a worker is replaced, the
/// count moves to the replacement's id.
#[derive(Default)]
pub struct RetryState {
    entries: Mutex<HashMap<WorkerId, Arc<Mutex<u32>>>>,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock one worker's counter.
    pub async fn lock(&self, id: WorkerId) -> OwnedMutexGuard<u32> {
        let slot = self.entries.lock().await.entry(id).or_default().clone();
        slot.lock_owned().await
    }

    pub async fn count(&self, id: WorkerId) -> u32 {
        *self.lock(id).await
    }

    pub async fn set(&self, id: WorkerId, count: u32) {
        *self.lock(id).await = count;
    }

    pub async fn reset(&self, id: WorkerId) {
        self.set(id, 0).await;
    }

    pub async fn remove(&self, id: WorkerId) {
        self.entries.lock().await.remove(&id);
    }
}

/// `initial × 2^attempt`, saturating.
pub fn backoff(initial: Duration, attempt: u32) -> Duration {
    initial.saturating_mul(2u32.saturating_pow(attempt))
}
