//! Worker descriptors and format capability matching.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type WorkerId = Uuid;

/// Input extension accepted by a pair for any source file.
pub const ANY_INPUT: &str = "*";

/// One conversion capability: any of `input` into any of `output`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatPair {
    #[serde(rename = "in")]
    pub input: Vec<String>,
    #[serde(rename = "out")]
    pub output: Vec<String>,
}

impl FormatPair {
    pub fn new(input: &[&str], output: &[&str]) -> Self {
        Self {
            input: input.iter().map(|s| s.to_ascii_lowercase()).collect(),
            output: output.iter().map(|s| s.to_ascii_lowercase()).collect(),
        }
    }

    /// Parse `step|igs>obj|fbx,stl>glb`.
    pub fn parse_list(s: &str) -> Result<Vec<FormatPair>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|raw| {
                let (input, output) = raw
                    .split_once('>')
                    .ok_or_else(|| format!("format pair '{raw}' is missing '>'"))?;
                let split = |side: &str| -> Vec<String> {
                    side.split('|')
                        .map(|f| f.trim().to_ascii_lowercase())
                        .filter(|f| !f.is_empty())
                        .collect()
                };
                let pair = FormatPair {
                    input: split(input),
                    output: split(output),
                };
                if pair.output.is_empty() {
                    return Err(format!("format pair '{raw}' has no output formats"));
                }
                Ok(pair)
            })
            .collect()
    }

    /// Every output and every input (lowercase) is handled by this pair.
    pub fn covers(&self, inputs: &[String], outputs: &[String]) -> bool {
        let has = |side: &[String], f: &str| side.iter().any(|s| s.eq_ignore_ascii_case(f));
        let any_input = has(&self.input, ANY_INPUT);
        outputs.iter().all(|f| has(&self.output, f))
            && (any_input || inputs.iter().all(|f| has(&self.input, f)))
    }
}

/// Scheduler-side view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub name: String,
    /// Where the control channel lives, e.g. `stdio:pid/4242`.
    pub control_channel: String,
    pub supported_formats: Vec<FormatPair>,
    pub max_parallel: u32,
    pub current_parallel: u32,
    pub last_healthy_time: DateTime<Utc>,
    pub last_progress_time: DateTime<Utc>,
    pub progress_percent: f64,
    pub retry_count: u32,
    /// Set whenever `current_parallel` drops to zero.
    pub idle_since: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl WorkerDescriptor {
    pub fn new(
        id: WorkerId,
        name: impl Into<String>,
        control_channel: impl Into<String>,
        supported_formats: Vec<FormatPair>,
        max_parallel: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            control_channel: control_channel.into(),
            supported_formats,
            max_parallel,
            current_parallel: 0,
            last_healthy_time: now,
            last_progress_time: now,
            progress_percent: 0.0,
            retry_count: 0,
            idle_since: Some(now),
            registered_at: now,
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.current_parallel < self.max_parallel
    }

    pub fn covers(&self, inputs: &[String], outputs: &[String]) -> bool {
        self.supported_formats
            .iter()
            .any(|pair| pair.covers(inputs, outputs))
    }

    /// Eligible for a job with these formats right now.
    pub fn can_accept(&self, inputs: &[String], outputs: &[String]) -> bool {
        self.has_capacity() && self.covers(inputs, outputs)
    }

    pub fn load_ratio(&self) -> f64 {
        if self.max_parallel == 0 {
            return 1.0;
        }
        f64::from(self.current_parallel) / f64::from(self.max_parallel)
    }

    /// Idle for longer than `threshold` at `now`.
    pub fn idle_longer_than(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        match (self.current_parallel, self.idle_since) {
            (0, Some(since)) => (now - since).to_std().is_ok_and(|idle| idle > threshold),
            _ => false,
        }
    }
}
