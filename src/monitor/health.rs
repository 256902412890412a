//! Worker health probing and classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::MonitorConfig;
use crate::error::WorkerError;
use crate::fleet::WorkerDescriptor;
use crate::process::{HealthMetrics, WorkerControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Healthy,
    /// Not healthy, but not yet past the stuck thresholds.
    Degraded,
    Stuck,
    Crashed,
}

#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub health_timeout: Duration,
    pub progress_timeout: Duration,
    pub min_progress_percent: f64,
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
}

impl From<&MonitorConfig> for HealthThresholds {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            health_timeout: config.health_timeout,
            progress_timeout: config.progress_timeout,
            min_progress_percent: config.min_progress_percent,
            max_cpu_percent: config.max_cpu_percent,
            max_memory_percent: config.max_memory_percent,
        }
    }
}

/// Raw answers from one supervision pass over a worker.
#[derive(Debug)]
pub struct Probe {
    pub alive: bool,
    pub liveness: Result<bool, WorkerError>,
    pub metrics: Result<HealthMetrics, WorkerError>,
}

impl Probe {
    pub fn is_healthy(&self, thresholds: &HealthThresholds) -> bool {
        let Ok(true) = self.liveness else {
            return false;
        };
        let Ok(metrics) = &self.metrics else {
            return false;
        };
        metrics.cpu_usage < thresholds.max_cpu_percent
            && metrics.memory_usage < thresholds.max_memory_percent
    }

    /// First probe error, for logging.
    pub fn error(&self) -> Option<&WorkerError> {
        self.liveness.as_ref().err().or(self.metrics.as_ref().err())
    }
}

/// Probe a worker, bounding each command by `deadline`. A worker whose
/// control channel is closed probes as not alive.
pub async fn probe(control: &dyn WorkerControl, deadline: Duration) -> Probe {
    let id = control.id();
    if !control.is_alive().await {
        return Probe {
            alive: false,
            liveness: Err(WorkerError::Crashed { id }),
            metrics: Err(WorkerError::Crashed { id }),
        };
    }

    let timed_out = |command: &str| WorkerError::ProbeTimeout {
        id,
        command: command.to_string(),
        timeout: deadline,
    };
    let liveness = tokio::time::timeout(deadline, control.check_health())
        .await
        .unwrap_or_else(|_| Err(timed_out("check_health")));
    let metrics = tokio::time::timeout(deadline, control.get_metrics())
        .await
        .unwrap_or_else(|_| Err(timed_out("get_metrics")));

    // A closed control channel cannot be recovered; treat the worker as gone.
    let alive = !channel_closed(&liveness) && !channel_closed(&metrics);
    Probe {
        alive,
        liveness,
        metrics,
    }
}

fn channel_closed<T>(result: &Result<T, WorkerError>) -> bool {
    matches!(result, Err(WorkerError::ChannelClosed { .. }))
}

/// Crashed, then Healthy, then Stuck; anything else is Degraded.
pub fn classify(
    descriptor: &WorkerDescriptor,
    probe: &Probe,
    thresholds: &HealthThresholds,
    now: DateTime<Utc>,
) -> WorkerHealth {
    if !probe.alive {
        return WorkerHealth::Crashed;
    }
    if probe.is_healthy(thresholds) {
        return WorkerHealth::Healthy;
    }

    let since_healthy = elapsed(descriptor.last_healthy_time, now);
    let since_progress = elapsed(descriptor.last_progress_time, now);
    let stalled = since_progress > thresholds.progress_timeout
        || descriptor.progress_percent < thresholds.min_progress_percent;
    if since_healthy > thresholds.health_timeout && stalled {
        WorkerHealth::Stuck
    } else {
        WorkerHealth::Degraded
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::FormatPair;
    use uuid::Uuid;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            health_timeout: Duration::from_secs(60),
            ..HealthThresholds::from(&MonitorConfig::default())
        }
    }

    fn descriptor() -> WorkerDescriptor {
        WorkerDescriptor::new(
            Uuid::new_v4(),
            "w",
            "fake",
            vec![FormatPair::new(&["step"], &["obj"])],
            2,
        )
    }

    fn probe(liveness: bool, cpu: f64, memory: f64) -> Probe {
        Probe {
            alive: true,
            liveness: Ok(liveness),
            metrics: Ok(HealthMetrics {
                cpu_usage: cpu,
                memory_usage: memory,
            }),
        }
    }

    #[test]
    fn healthy_needs_liveness_and_headroom() {
        let t = thresholds();
        assert!(probe(true, 79.9, 69.9).is_healthy(&t));
        assert!(!probe(true, 80.0, 10.0).is_healthy(&t));
        assert!(!probe(true, 10.0, 70.0).is_healthy(&t));
        assert!(!probe(false, 10.0, 10.0).is_healthy(&t));
    }

    #[test]
    fn stale_worker_with_low_progress_is_stuck() {
        let now = Utc::now();
        let mut d = descriptor();
        d.last_healthy_time = now - chrono::Duration::minutes(2);
        d.last_progress_time = now;
        d.progress_percent = 10.0;

        let unhealthy = probe(false, 10.0, 10.0);
        assert_eq!(classify(&d, &unhealthy, &thresholds(), now), WorkerHealth::Stuck);

        // Good progress and a recent update keep it merely degraded.
        d.progress_percent = 50.0;
        assert_eq!(classify(&d, &unhealthy, &thresholds(), now), WorkerHealth::Degraded);

        // A silent progress stream is enough on its own.
        d.last_progress_time = now - chrono::Duration::minutes(10);
        assert_eq!(classify(&d, &unhealthy, &thresholds(), now), WorkerHealth::Stuck);
    }

    #[test]
    fn recent_health_is_never_stuck() {
        let now = Utc::now();
        let mut d = descriptor();
        d.last_healthy_time = now - chrono::Duration::seconds(30);
        d.progress_percent = 0.0;
        let unhealthy = probe(false, 10.0, 10.0);
        assert_eq!(classify(&d, &unhealthy, &thresholds(), now), WorkerHealth::Degraded);
    }

    #[test]
    fn crash_wins_over_everything() {
        let now = Utc::now();
        let d = descriptor();
        let id = d.id;
        let dead = Probe {
            alive: false,
            liveness: Err(WorkerError::Crashed { id }),
            metrics: Err(WorkerError::Crashed { id }),
        };
        assert_eq!(classify(&d, &dead, &thresholds(), now), WorkerHealth::Crashed);
        assert!(dead.error().is_some());
    }

    #[tokio::test]
    async fn closed_channel_probes_as_crashed() {
        use std::sync::atomic::Ordering;

        use crate::fleet::registry::fakes::FakeWorker;

        let d = descriptor();
        let fake = FakeWorker::new(d.id);
        fake.hang_up.store(true, Ordering::SeqCst);

        let first = super::probe(fake.as_ref(), Duration::from_millis(50)).await;
        assert!(matches!(first.liveness, Err(WorkerError::ProbeTimeout { .. })));
        assert!(!first.alive);
        assert_eq!(classify(&d, &first, &thresholds(), Utc::now()), WorkerHealth::Crashed);

        let again = super::probe(fake.as_ref(), Duration::from_millis(50)).await;
        assert!(matches!(again.liveness, Err(WorkerError::ChannelClosed { .. })));
        assert!(!again.alive);
    }

    #[test]
    fn healthy_probe_ignores_stale_timestamps() {
        let now = Utc::now();
        let mut d = descriptor();
        d.last_healthy_time = now - chrono::Duration::hours(1);
        assert_eq!(
            classify(&d, &probe(true, 1.0, 1.0), &thresholds(), now),
            WorkerHealth::Healthy
        );
    }
}
