//! Job entity and admission request types.
//!
//! Maps use `BTreeMap` so that serialization is stable; the admission
//! fingerprint depends on it.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fleet::WorkerId;
use crate::jobs::state::{JobStatus, MAX_TRANSITIONS, StateTransition};

pub type JobId = Uuid;

/// Who a job is billed to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub app_id: String,
}

impl OwnerRef {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn tenant(user_id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    /// Tenant id when present and non-empty.
    pub fn tenant_key(&self) -> Option<&str> {
        self.tenant_id.as_deref().filter(|t| !t.is_empty())
    }
}

impl std::fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.tenant_key() {
            Some(tenant) => write!(f, "{}@{}", self.user_id, tenant),
            None => write!(f, "{}", self.user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Vip,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Vip => "vip",
        }
    }
}

/// One requested output format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetFormat {
    /// Output extension, e.g. `obj`.
    pub name: String,
    /// Selects the destination folder from `FolderConfig::target_url`.
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub pipe: Vec<String>,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
}

impl TargetFormat {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            tag: name.clone(),
            name,
            ..Self::default()
        }
    }
}

/// Source file descriptor with its destinations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderConfig {
    pub name: String,
    #[serde(default)]
    pub transform: bool,
    #[serde(default)]
    pub file_size: u64,
    #[serde(default)]
    pub remote_url: String,
    /// Target tag to destination directory.
    #[serde(default)]
    pub target_url: BTreeMap<String, String>,
    /// Target index to explicit destination file name.
    #[serde(default)]
    pub target_url_map: BTreeMap<String, String>,
}

impl FolderConfig {
    pub fn source(name: impl Into<String>, remote_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transform: true,
            remote_url: remote_url.into(),
            ..Self::default()
        }
    }

    /// Whether this entry is converted at all.
    pub fn is_transformable(&self) -> bool {
        self.transform && !self.remote_url.is_empty()
    }

    /// Lowercase extension of the file name.
    pub fn input_format(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// Destination paths for one source file, keyed by target tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadEntry {
    pub remote_url: String,
    pub uploads: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u32,
    pub processed: u32,
    pub percent_complete: f64,
}

/// Incoming conversion request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversionRequest {
    pub owner: OwnerRef,
    pub target_formats: Vec<TargetFormat>,
    pub folder_config: Vec<FolderConfig>,
    #[serde(default)]
    pub marks: Vec<String>,
}

impl ConversionRequest {
    /// Lowercase output format names.
    pub fn output_formats(&self) -> Vec<String> {
        self.target_formats
            .iter()
            .map(|t| t.name.to_ascii_lowercase())
            .collect()
    }

    pub fn transformable_files(&self) -> impl Iterator<Item = &FolderConfig> {
        self.folder_config.iter().filter(|f| f.is_transformable())
    }
}

/// A conversion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: OwnerRef,
    pub priority: Priority,
    pub status: JobStatus,
    pub target_formats: Vec<TargetFormat>,
    pub folder_config: Vec<FolderConfig>,
    pub progress: Progress,
    pub retry_count: u32,
    pub marks: Vec<String>,
    pub fingerprint: String,
    /// Worker currently holding the job.
    pub worker_id: Option<WorkerId>,
    pub error: Option<String>,
    pub upload_plan: Vec<UploadEntry>,
    pub created_at: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    #[serde(default)]
    pub transitions: Vec<StateTransition>,
    /// Set once the job outlived its deadline. The stored status stays at
    /// the last persisted value.
    #[serde(default)]
    pub timed_out_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job from an admitted request.
    pub fn new(request: ConversionRequest, priority: Priority, fingerprint: String) -> Self {
        let now = Utc::now();
        let upload_plan = plan_uploads(&request);
        Self {
            id: Uuid::new_v4(),
            owner: request.owner,
            priority,
            status: JobStatus::Pending,
            target_formats: request.target_formats,
            folder_config: request.folder_config,
            progress: Progress::default(),
            retry_count: 0,
            marks: request.marks,
            fingerprint,
            worker_id: None,
            error: None,
            upload_plan,
            created_at: now,
            update_time: now,
            transitions: Vec::new(),
            timed_out_at: None,
        }
    }

    /// Scheduler view of a stored record: a job marked past its deadline
    /// reads as `Timeout`.
    pub fn into_view(mut self) -> Self {
        if self.timed_out_at.is_some() && !self.status.is_terminal() {
            self.status = JobStatus::Timeout;
        }
        self
    }

    /// Move to `new_status`, recording the transition.
    ///
    /// Leaves the job untouched and returns the current status when the
    /// edge is not allowed.
    pub fn transition_to(
        &mut self,
        new_status: JobStatus,
        reason: Option<String>,
    ) -> Result<(), JobStatus> {
        if !self.status.can_transition_to(new_status) {
            return Err(self.status);
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.status,
            to: new_status,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = new_status;
        self.update_time = now;
        Ok(())
    }

    /// Lowercase output format names.
    pub fn output_formats(&self) -> Vec<String> {
        self.target_formats
            .iter()
            .map(|t| t.name.to_ascii_lowercase())
            .collect()
    }

    /// Distinct lowercase input formats of the files to convert.
    pub fn input_formats(&self) -> Vec<String> {
        let mut formats: Vec<String> = self
            .folder_config
            .iter()
            .filter(|f| f.is_transformable())
            .filter_map(|f| f.input_format())
            .collect();
        formats.sort();
        formats.dedup();
        formats
    }
}

/// Compute destination paths for every transformable file.
///
/// An explicit `target_url_map` entry for the target's index wins; otherwise
/// the file stem gets the target extension.
pub fn plan_uploads(request: &ConversionRequest) -> Vec<UploadEntry> {
    request
        .transformable_files()
        .map(|file| {
            let stem = Path::new(&file.name)
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or(&file.name);
            let uploads = request
                .target_formats
                .iter()
                .enumerate()
                .map(|(index, target)| {
                    let dir = file
                        .target_url
                        .get(&target.tag)
                        .map(String::as_str)
                        .unwrap_or("");
                    let leaf = match file.target_url_map.get(&index.to_string()) {
                        Some(explicit) => explicit.clone(),
                        None => format!("{stem}.{}", target.name),
                    };
                    (target.tag.clone(), join_path(dir, &leaf))
                })
                .collect();
            UploadEntry {
                remote_url: file.remote_url.clone(),
                uploads,
            }
        })
        .collect()
}

fn join_path(dir: &str, leaf: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        leaf.to_string()
    } else {
        format!("{dir}/{}", leaf.trim_start_matches('/'))
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A request converting one STEP file into the given formats.
    pub fn request(owner: OwnerRef, formats: &[&str]) -> ConversionRequest {
        let mut file = FolderConfig::source("part.step", "obs://bucket/in/part.step");
        for format in formats {
            file.target_url
                .insert(format.to_string(), format!("obs://bucket/out/{format}"));
        }
        ConversionRequest {
            owner,
            target_formats: formats.iter().map(|f| TargetFormat::named(*f)).collect(),
            folder_config: vec![file],
            marks: Vec::new(),
        }
    }
}
