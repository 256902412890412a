//! Worker control-channel framing.
//!
//! Commands are single lines on the worker's stdin; each gets exactly one
//! line back on stdout. `text` is the plain legacy form:
//!
//! ```text
//! check_health -> healthy
//! get_metrics  -> {"cpuUsage": 12.5, "memoryUsage": 40.1}
//! shutdown     -> (process exits)
//! ```
//!
//! `json-v1` wraps both directions in a versioned envelope:
//! `{"v":1,"cmd":"check_health"}` → `{"v":1,"ok":true,"status":"healthy"}`.
//! A reply carrying another version is rejected, never reconciled.

use serde::{Deserialize, Serialize};

use crate::error::WorkerError;
use crate::fleet::WorkerId;

pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Framing {
    #[default]
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "json-v1")]
    JsonV1,
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json-v1" | "json" => Ok(Self::JsonV1),
            other => Err(format!("unknown framing '{other}', expected text or json-v1")),
        }
    }
}

impl std::fmt::Display for Framing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::JsonV1 => write!(f, "json-v1"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CheckHealth,
    GetMetrics,
    Shutdown,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckHealth => "check_health",
            Self::GetMetrics => "get_metrics",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Resource usage reported by a worker, in percent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthMetrics {
    #[serde(rename = "cpuUsage")]
    pub cpu_usage: f64,
    #[serde(rename = "memoryUsage")]
    pub memory_usage: f64,
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    v: u32,
    cmd: &'a str,
}

#[derive(Deserialize)]
struct ResponseEnvelope {
    v: u32,
    #[serde(default)]
    ok: bool,
    status: Option<String>,
    metrics: Option<HealthMetrics>,
    error: Option<String>,
}

/// Encode one command line, without the trailing newline.
pub fn encode(framing: Framing, command: Command) -> String {
    match framing {
        Framing::Text => command.as_str().to_string(),
        Framing::JsonV1 => serde_json::to_string(&RequestEnvelope {
            v: PROTOCOL_VERSION,
            cmd: command.as_str(),
        })
        .unwrap_or_else(|_| command.as_str().to_string()),
    }
}

/// Interpret a `check_health` reply.
pub fn decode_health(framing: Framing, id: WorkerId, line: &str) -> Result<bool, WorkerError> {
    let line = line.trim();
    match framing {
        Framing::Text => Ok(line == "healthy"),
        Framing::JsonV1 => {
            let envelope = decode_envelope(id, line)?;
            Ok(envelope.ok && envelope.status.as_deref() == Some("healthy"))
        }
    }
}

/// Interpret a `get_metrics` reply.
pub fn decode_metrics(
    framing: Framing,
    id: WorkerId,
    line: &str,
) -> Result<HealthMetrics, WorkerError> {
    let line = line.trim();
    match framing {
        Framing::Text => serde_json::from_str(line).map_err(|e| WorkerError::Protocol {
            id,
            reason: format!("bad metrics '{line}': {e}"),
        }),
        Framing::JsonV1 => {
            let envelope = decode_envelope(id, line)?;
            if !envelope.ok {
                return Err(WorkerError::Protocol {
                    id,
                    reason: envelope
                        .error
                        .unwrap_or_else(|| "metrics request failed".to_string()),
                });
            }
            envelope.metrics.ok_or_else(|| WorkerError::Protocol {
                id,
                reason: "reply carries no metrics".to_string(),
            })
        }
    }
}

fn decode_envelope(id: WorkerId, line: &str) -> Result<ResponseEnvelope, WorkerError> {
    let envelope: ResponseEnvelope =
        serde_json::from_str(line).map_err(|e| WorkerError::Protocol {
            id,
            reason: format!("bad envelope '{line}': {e}"),
        })?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(WorkerError::ProtocolMismatch {
            id,
            expected: PROTOCOL_VERSION,
            got: envelope.v,
        });
    }
    Ok(envelope)
}
