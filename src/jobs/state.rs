//! Conversion job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a conversion job.
///
/// Numeric codes are the ones workers report in progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, not yet bound to a worker.
    Pending,
    /// Bound to a worker, not yet fetching input.
    Start,
    /// Worker is downloading source files.
    Download,
    DownloadFailed,
    /// Worker is converting.
    Processing,
    /// Cancellation requested; waiting for the worker to stop.
    Canceling,
    Canceled,
    Processed,
    ProcessFailed,
    /// Worker is uploading converted files.
    Uploading,
    UploadingFailed,
    /// Wall-clock deadline elapsed. Scheduler view only, never persisted.
    Timeout,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// Reassignment back to `Pending` is listed here but only the scheduler's
    /// reassignment path performs it.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        if target == Canceling {
            return !self.is_terminal() && *self != Canceling;
        }
        if target == Timeout {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Pending, Start) |
            (Start, Download) |
            (Download, DownloadFailed) | (Download, Processing) |
            (Processing, ProcessFailed) | (Processing, Processed) |
            (Processing, Uploading) |
            (Uploading, UploadingFailed) | (Uploading, Processed) |
            (Canceling, Canceled) |
            // Reassignment after a worker is lost
            (Start, Pending) | (Download, Pending) |
            (Processing, Pending) | (Uploading, Pending)
        )
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Processed
                | Self::ProcessFailed
                | Self::UploadingFailed
                | Self::Canceled
                | Self::DownloadFailed
                | Self::Timeout
        )
    }

    /// Terminal statuses that refund quota and raise an alert.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::DownloadFailed | Self::ProcessFailed | Self::UploadingFailed
        )
    }

    /// Statuses in which a worker holds the job.
    pub fn is_dispatched(&self) -> bool {
        matches!(
            self,
            Self::Start | Self::Download | Self::Processing | Self::Uploading
        )
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Start => 1,
            Self::Download => 2,
            Self::DownloadFailed => 3,
            Self::Processing => 4,
            Self::Canceling => 5,
            Self::Canceled => 6,
            Self::Processed => 7,
            Self::ProcessFailed => 8,
            Self::Uploading => 9,
            Self::UploadingFailed => 10,
            Self::Timeout => 11,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Pending,
            1 => Self::Start,
            2 => Self::Download,
            3 => Self::DownloadFailed,
            4 => Self::Processing,
            5 => Self::Canceling,
            6 => Self::Canceled,
            7 => Self::Processed,
            8 => Self::ProcessFailed,
            9 => Self::Uploading,
            10 => Self::UploadingFailed,
            11 => Self::Timeout,
            _ => return None,
        })
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Start => "start",
            Self::Download => "download",
            Self::DownloadFailed => "download_failed",
            Self::Processing => "processing",
            Self::Canceling => "canceling",
            Self::Canceled => "canceled",
            Self::Processed => "processed",
            Self::ProcessFailed => "process_failed",
            Self::Uploading => "uploading",
            Self::UploadingFailed => "uploading_failed",
            Self::Timeout => "timeout",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown job status '{s}'"))
    }
}

/// A status transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Cap on the per-job transition history.
pub const MAX_TRANSITIONS: usize = 200;

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 12] = [
        JobStatus::Pending,
        JobStatus::Start,
        JobStatus::Download,
        JobStatus::DownloadFailed,
        JobStatus::Processing,
        JobStatus::Canceling,
        JobStatus::Canceled,
        JobStatus::Processed,
        JobStatus::ProcessFailed,
        JobStatus::Uploading,
        JobStatus::UploadingFailed,
        JobStatus::Timeout,
    ];

    #[test]
    fn forward_path_is_valid() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Start));
        assert!(Start.can_transition_to(Download));
        assert!(Download.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Uploading));
        assert!(Uploading.can_transition_to(Processed));
        assert!(Processing.can_transition_to(Processed));
    }

    #[test]
    fn skipping_stages_is_invalid() {
        use JobStatus::*;
        assert!(!Pending.can_transition_to(Processing));
        assert!(!Start.can_transition_to(Uploading));
        assert!(!Download.can_transition_to(Processed));
        assert!(!Pending.can_transition_to(Canceled));
    }

    #[test]
    fn terminal_statuses_reject_everything() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from} should not move to {to}"
                );
            }
        }
    }

    #[test]
    fn any_active_status_can_cancel() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            if *from == JobStatus::Canceling {
                assert!(!from.can_transition_to(JobStatus::Canceling));
            } else {
                assert!(from.can_transition_to(JobStatus::Canceling));
            }
        }
        assert!(JobStatus::Canceling.can_transition_to(JobStatus::Canceled));
        assert!(!JobStatus::Canceling.can_transition_to(JobStatus::Processed));
        assert!(!JobStatus::Canceling.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn failed_class_is_subset_of_terminal() {
        let failed: Vec<_> = ALL.iter().filter(|s| s.is_failed()).collect();
        assert_eq!(failed.len(), 3);
        assert!(failed.iter().all(|s| s.is_terminal()));
        assert!(!JobStatus::Timeout.is_failed());
        assert!(!JobStatus::Canceled.is_failed());
    }

    #[test]
    fn codes_roundtrip() {
        for status in ALL {
            assert_eq!(JobStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(JobStatus::from_code(12), None);
        assert_eq!(JobStatus::Timeout.code(), 11);
    }

    #[test]
    fn display_matches_serde_name() {
        for status in ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }
}
