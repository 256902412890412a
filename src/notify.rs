//! Operator notifications.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::fleet::WorkerId;
use crate::jobs::{JobId, JobStatus, OwnerRef};

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Everything the control plane alerts on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Queue depth crossed the pressure threshold.
    QueuePressure {
        deployment: String,
        depth: usize,
        threshold: usize,
    },
    /// A worker crashed or got stuck and is being replaced.
    WorkerFailed {
        worker_id: WorkerId,
        reason: String,
        retry_count: u32,
    },
    /// A worker exhausted its retries and was removed from the fleet.
    WorkerRetired { worker_id: WorkerId, retries: u32 },
    JobFailed {
        job_id: JobId,
        owner: OwnerRef,
        status: JobStatus,
        error: Option<String>,
    },
}

impl Notification {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::QueuePressure { .. } => "queue.pressure",
            Self::WorkerFailed { .. } => "worker.failed",
            Self::WorkerRetired { .. } => "worker.retired",
            Self::JobFailed { .. } => "job.failed",
        }
    }
}

/// Fire-and-forget alert sink.
pub trait Notifier: Send + Sync {
    fn publish(&self, notification: Notification);
}

/// Logs every notification and fans it out to subscribers.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier for BroadcastNotifier {
    fn publish(&self, notification: Notification) {
        match &notification {
            Notification::WorkerRetired { .. } | Notification::QueuePressure { .. } => {
                warn!(topic = notification.topic(), ?notification, "Notification")
            }
            _ => info!(topic = notification.topic(), ?notification, "Notification"),
        }
        // Ok if nobody is subscribed
        let _ = self.tx.send(notification);
    }
}
