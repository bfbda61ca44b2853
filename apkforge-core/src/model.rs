//! Persisted records: batches, counters and templates.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use rand::Rng;
use rand::distributions::Alphanumeric;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// File name of the release package inside a batch's artifact directory.
pub const ARTIFACT_FILENAME: &str = "app-release.apk";

/// Project used when nothing can be inferred from the artifact name.
pub const DEFAULT_PROJECT: &str = "DEFAULT";

static NAME_RX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 _-]{2,40}$").expect("static regex")
});

/// Lifecycle of a build request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Available,
    WaitingConfirm,
    Confirmed,
    Building,
    Built,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Available => "available",
            Status::WaitingConfirm => "waiting_confirm",
            Status::Confirmed => "confirmed",
            Status::Building => "building",
            Status::Built => "built",
            Status::Error => "error",
        }
    }

    /// States a batch may be in immediately before entering `self`.
    ///
    /// Intake states have no predecessors: nothing transitions back into them.
    pub fn predecessors(&self) -> &'static [Status] {
        match self {
            Status::Available | Status::WaitingConfirm => &[],
            Status::Confirmed => &[Status::Available, Status::WaitingConfirm],
            Status::Building => &[Status::Confirmed],
            Status::Built => &[Status::Building],
            Status::Error => &[Status::Confirmed, Status::Building],
        }
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        next.predecessors().contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Built | Status::Error)
    }

    /// Whether a confirm request may claim a batch in this state.
    pub fn is_confirmable(&self) -> bool {
        self.can_transition_to(Status::Confirmed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Status::Available),
            "waiting_confirm" => Ok(Status::WaitingConfirm),
            "confirmed" => Ok(Status::Confirmed),
            "building" => Ok(Status::Building),
            "built" => Ok(Status::Built),
            "error" => Ok(Status::Error),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// One build request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub artifact_name: String,
    pub project: Option<String>,
    pub status: Status,
    /// Per-project sequence number, set once.
    pub apk_seq: Option<u64>,
    /// Index of the template injected into the build, set once.
    pub template_index_used: Option<u64>,
    /// Object path of the built artifact; only present when `status == built`.
    pub artifact_path: Option<String>,
    pub error: Option<String>,
    pub created_at: i64,
    pub build_start: Option<i64>,
    pub built_at: Option<i64>,
}

impl Batch {
    /// Project this batch builds for, inferring it from the name if unset.
    pub fn resolved_project(&self) -> String {
        match self.project.as_deref().map(str::trim) {
            Some(p) if !p.is_empty() => p.to_string(),
            _ => infer_project(&self.artifact_name),
        }
    }

    /// File name used when delivering the artifact to a requester.
    pub fn delivery_filename(&self) -> String {
        let name = self.artifact_name.trim();
        let name = if name.is_empty() { "app" } else { name };
        format!("{name}-release.apk")
    }
}

/// Intake request for a new batch.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub id: String,
    pub artifact_name: String,
    pub project: Option<String>,
    pub status: Status,
}

impl NewBatch {
    /// Validate the artifact name and build an `available` batch.
    pub fn available(
        id: Option<String>,
        artifact_name: &str,
        project: Option<String>,
    ) -> Result<Self, WorkflowError> {
        validate_artifact_name(artifact_name)?;
        Ok(Self {
            id: id.unwrap_or_else(generate_batch_id),
            artifact_name: artifact_name.trim().to_string(),
            project: project.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()),
            status: Status::Available,
        })
    }
}

/// Partial update of a batch. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchPatch {
    pub status: Option<Status>,
    pub project: Option<String>,
    pub apk_seq: Option<u64>,
    pub template_index_used: Option<u64>,
    pub artifact_path: Option<String>,
    pub error: Option<String>,
    pub build_start: Option<i64>,
    pub built_at: Option<i64>,
}

impl BatchPatch {
    pub fn confirmed(project: &str) -> Self {
        Self {
            status: Some(Status::Confirmed),
            project: Some(project.to_string()),
            ..Default::default()
        }
    }

    pub fn building(seq: u64, template_index: u64, started_at: i64) -> Self {
        Self {
            status: Some(Status::Building),
            apk_seq: Some(seq),
            template_index_used: Some(template_index),
            build_start: Some(started_at),
            ..Default::default()
        }
    }

    pub fn built(artifact_path: String, built_at: i64) -> Self {
        Self {
            status: Some(Status::Built),
            artifact_path: Some(artifact_path),
            built_at: Some(built_at),
            ..Default::default()
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: Some(Status::Error),
            error: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Last allocated sequence number for a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Counter {
    pub project: String,
    pub last_seq: u64,
}

/// Configuration payload injected into builds of one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub project: String,
    pub index: u64,
    pub data_text: String,
}

/// Derive a project namespace from an artifact name.
///
/// `"demo app-v2"` → `"DEMOAPP"`: the part before the first `-`, with all
/// whitespace removed, uppercased. Falls back to the whole name when there
/// is no usable prefix.
pub fn infer_project(artifact_name: &str) -> String {
    let squash = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase()
    };
    let prefix = squash(artifact_name.split('-').next().unwrap_or_default());
    if !prefix.is_empty() {
        return prefix;
    }
    let whole = squash(artifact_name);
    if whole.is_empty() {
        DEFAULT_PROJECT.to_string()
    } else {
        whole
    }
}

/// Intake rule for artifact names.
pub fn validate_artifact_name(name: &str) -> Result<(), WorkflowError> {
    if NAME_RX.is_match(name.trim()) {
        Ok(())
    } else {
        Err(WorkflowError::Validation(format!(
            "artifact name {name:?} must be 3-41 characters of letters, digits, space, '_' or '-'"
        )))
    }
}

/// Deterministic object path for a batch's build output.
pub fn artifact_path(batch_id: &str) -> String {
    format!("builds/{batch_id}/{ARTIFACT_FILENAME}")
}

/// Random 16-character identifier for batches created by operator tooling.
pub fn generate_batch_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
