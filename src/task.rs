//! Core task records and the task state machine.
//!
//! This module defines the records the orchestration layer reads and writes
//! through the record store:
//!
//! - `TaskStatus`: lifecycle state machine for fine-tuning tasks
//! - `TaskRecord`: a fine-tuning task and its accumulated results
//! - `TaskPatch`: partial update applied with the results-merge policy
//! - `RunningTaskMarker`: singleton accelerator-claim marker
//! - `GenerationMetadata`: live progress document for dataset generation
//! - `GeneratedPair`: one synthetic question/answer pair
//! - `DeploymentRecord`: a running serving container and its host port

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Identifier of a fine-tuning task.
pub type TaskId = i64;

/// Identifier of a project (groups tasks and datasets).
pub type ProjectId = i64;

/// Identifier of a dataset.
pub type DatasetId = i64;

/// Identifier of a model registry entry.
pub type ModelId = i64;

/// Lifecycle state of a task.
///
/// The same vocabulary is used for task records, the broker's per-job state
/// storage and the `download_status` field, so transitions can be compared
/// across all three without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Dispatched but not yet picked up by a worker.
    #[serde(rename = "PENDING")]
    Pending,
    /// A worker has begun executing the job.
    #[serde(rename = "STARTED")]
    Started,
    /// Terminal: the job finished successfully.
    #[serde(rename = "SUCCESS")]
    Success,
    /// Terminal: the job finished with an error.
    #[serde(rename = "FAILURE")]
    Failure,
    /// The broker re-queued the job; a worker may start it again.
    #[serde(rename = "RETRY")]
    Retry,
    /// Terminal for this run: the job was cancelled by an operator.
    #[serde(rename = "REVOKED")]
    Revoked,
}

impl TaskStatus {
    /// Returns whether this state ends the current run.
    ///
    /// A revoked or failed task can still be restarted, but restarting is a
    /// dedicated operation that resets the record rather than a transition.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Revoked
        )
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    ///
    /// `Started` may only be entered from `Pending` or `Retry`. `Revoked` is
    /// reachable from any non-terminal state. Re-asserting the current state
    /// is allowed so repeated result patches carrying the same status are not
    /// rejected.
    pub fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Pending, Started) | (Retry, Started) => true,
            (Started, Success) | (Started, Failure) | (Started, Retry) => true,
            (from, Revoked) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Wire representation used by the record store and the broker.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Retry => "RETRY",
            TaskStatus::Revoked => "REVOKED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "STARTED" => Ok(TaskStatus::Started),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILURE" => Ok(TaskStatus::Failure),
            "RETRY" => Ok(TaskStatus::Retry),
            "REVOKED" => Ok(TaskStatus::Revoked),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// A fine-tuning task as stored by the record store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique identifier of the task.
    pub id: TaskId,
    /// Project the task belongs to.
    pub project_id: ProjectId,
    /// Task flavor, e.g. "QLORA".
    pub task_type: String,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// Opaque configuration document (hyperparameters, dataset refs).
    #[serde(default)]
    pub configs: Value,
    /// Accumulated output document; merged one level deep on update.
    #[serde(default)]
    pub results: Map<String, Value>,
    /// Handle of the most recent queue job dispatched for this task.
    #[serde(default)]
    pub job_handle: Option<String>,
    /// State of the deployment-archive download, if one was requested.
    #[serde(default)]
    pub download_status: Option<TaskStatus>,
    /// Archive download progress in integer percent (0-100).
    #[serde(default)]
    pub download_progress: u8,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last modified.
    pub modified_at: DateTime<Utc>,
}

impl TaskRecord {
    /// Creates a fresh `PENDING` record.
    pub fn new(id: TaskId, project_id: ProjectId, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id,
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            configs: Value::Null,
            results: Map::new(),
            job_handle: None,
            download_status: None,
            download_progress: 0,
            created_at: now,
            modified_at: now,
        }
    }

    /// Sets the configuration document.
    pub fn with_configs(mut self, configs: Value) -> Self {
        self.configs = configs;
        self
    }

    /// Applies a partial update using the merge policy: top-level scalar
    /// fields replace, the `results` document merges one level deep (new
    /// keys inserted, colliding keys overwritten, other keys preserved).
    pub fn apply_patch(&mut self, patch: &TaskPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(ref handle) = patch.job_handle {
            self.job_handle = Some(handle.clone());
        }
        if let Some(ref results) = patch.results {
            merge_results(&mut self.results, results);
        }
        if let Some(download_status) = patch.download_status {
            self.download_status = Some(download_status);
        }
        if let Some(progress) = patch.download_progress {
            self.download_progress = progress;
        }
        self.modified_at = Utc::now();
    }

    /// Resets the record for a fresh run: status back to `PENDING`, results
    /// cleared, the new job handle recorded. Valid from any prior state.
    pub fn reset_for_restart(&mut self, job_handle: impl Into<String>) {
        self.status = TaskStatus::Pending;
        self.results = Map::new();
        self.job_handle = Some(job_handle.into());
        self.modified_at = Utc::now();
    }
}

/// Partial update for a task record.
///
/// Only the fields that are `Some` are touched. The `results` field is
/// merged, never replaced; clearing results is reserved to the restart
/// operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_progress: Option<u8>,
}

impl TaskPatch {
    /// Creates a patch that only sets the lifecycle state.
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Creates a patch that only updates the download fields.
    pub fn download(status: TaskStatus, progress: u8) -> Self {
        Self {
            download_status: Some(status),
            download_progress: Some(progress),
            ..Default::default()
        }
    }

    /// Sets the job handle.
    pub fn with_job_handle(mut self, handle: impl Into<String>) -> Self {
        self.job_handle = Some(handle.into());
        self
    }

    /// Sets the full results document to merge in.
    pub fn with_results(mut self, results: Map<String, Value>) -> Self {
        self.results = Some(results);
        self
    }

    /// Adds a single key to the results document to merge in.
    pub fn with_result(mut self, key: impl Into<String>, value: Value) -> Self {
        self.results
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }

    /// Returns whether the patch touches nothing.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.job_handle.is_none()
            && self.results.is_none()
            && self.download_status.is_none()
            && self.download_progress.is_none()
    }
}

/// Merges `patch` into `existing` one level deep.
///
/// New keys are inserted, colliding keys are overwritten with the incoming
/// value, keys absent from `patch` are preserved. Nested objects are
/// replaced wholesale; there is no recursive merge.
pub fn merge_results(existing: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        existing.insert(key.clone(), value.clone());
    }
}

/// Singleton marker recording which task currently claims the shared
/// accelerator.
///
/// An empty marker means nothing is claimed. The marker is advisory: it is
/// written by the training before-start hook, read by the crash-recovery
/// scanner and the serving pre-flight check, and overwritten by the next
/// training run. It never answers "is the job running" by itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningTaskMarker {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub job_handle: Option<String>,
}

impl RunningTaskMarker {
    /// Marker claiming the accelerator for the given task and job.
    pub fn claimed(task_id: TaskId, job_handle: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id),
            job_handle: Some(job_handle.into()),
        }
    }

    /// Empty marker: nothing claims the accelerator.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns whether any task currently claims the accelerator.
    pub fn is_claimed(&self) -> bool {
        self.job_handle.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// Live progress document for a dataset generation job.
///
/// Present only while the job runs; cleared to null by the always-run
/// cleanup when the job ends for any reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMetadata {
    /// Units in the current source document.
    pub total_pages: u32,
    /// One-based index of the unit currently being processed.
    pub current_page: u32,
    /// Free-text phase label, e.g. `LOADING MODEL`.
    pub status: String,
    /// Set once an abort has been observed.
    pub is_cancel: bool,
    /// Source documents fully processed so far.
    pub processed_files: u32,
    /// Total source documents in this job.
    pub total_files: u32,
    /// Handle of the queue job producing this dataset.
    pub job_handle: String,
}

impl GenerationMetadata {
    /// Phase label while the generation model is being warmed up.
    pub const PHASE_LOADING_MODEL: &'static str = "LOADING MODEL";
    /// Phase label while units are being generated.
    pub const PHASE_GENERATING_DATA: &'static str = "GENERATING DATA";

    /// Creates the initial metadata for a job over `total_files` documents.
    pub fn new(job_handle: impl Into<String>, total_files: u32) -> Self {
        Self {
            total_pages: 0,
            current_page: 0,
            status: String::new(),
            is_cancel: false,
            processed_files: 0,
            total_files,
            job_handle: job_handle.into(),
        }
    }
}

/// One synthetic question/answer pair produced by the generation pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeneratedPair {
    pub user_message: String,
    pub assistant_message: String,
}

impl GeneratedPair {
    pub fn new(user_message: impl Into<String>, assistant_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            assistant_message: assistant_message.into(),
        }
    }
}

/// Compute device a serving container is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Accelerator-backed serving (shared with training).
    Xpu,
    /// CPU-only serving.
    Cpu,
}

impl DeviceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceKind::Xpu => "xpu",
            DeviceKind::Cpu => "cpu",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xpu" => Ok(DeviceKind::Xpu),
            "cpu" => Ok(DeviceKind::Cpu),
            other => Err(format!("unknown device kind: {other}")),
        }
    }
}

/// A serving deployment as stored by the record store.
///
/// The set of recorded `host_port` values is the source of truth for the
/// lifecycle manager's port-collision check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: i64,
    /// Task whose fine-tuned weights this deployment serves.
    pub model_id: TaskId,
    pub host_address: String,
    pub host_port: u16,
    pub device: DeviceKind,
    pub created_at: DateTime<Utc>,
}

/// Request to create a deployment record after a container started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeployment {
    pub model_id: TaskId,
    pub host_address: String,
    pub host_port: u16,
    pub device: DeviceKind,
}
