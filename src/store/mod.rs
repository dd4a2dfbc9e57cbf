//! Record store access.
//!
//! The record store is the platform's CRUD backend. Workers never talk to
//! its database directly; everything goes through the HTTP API modeled by
//! the [`RecordStore`] trait. An in-memory implementation backs tests and
//! doubles as the reference for the merge and transition semantics.

mod http;
mod memory;

pub use http::HttpRecordStore;
pub use memory::MemoryRecordStore;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::hardware::HardwareInfo;
use crate::task::{
    DatasetId, DeploymentRecord, GeneratedPair, GenerationMetadata, ModelId, NewDeployment,
    RunningTaskMarker, TaskId, TaskPatch, TaskRecord, TaskStatus,
};

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store request failed: {0}")]
    Request(String),

    #[error("record store returned {code}: {message}")]
    Api { code: u16, message: String },

    #[error("failed to decode record store response: {0}")]
    Decode(String),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("illegal status transition from {from} to {to}")]
    IllegalTransition { from: TaskStatus, to: TaskStatus },
}

/// Interface to the platform record store.
///
/// Task updates follow the merge policy: top-level scalars replace, the
/// `results` document merges one level deep. Clearing results happens only
/// through [`RecordStore::restart_task`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetches a task record.
    async fn get_task(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    /// Applies a partial update to a task record.
    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError>;

    /// Resets a task for a fresh run: status `PENDING`, results cleared,
    /// new job handle recorded. Valid from any prior state.
    async fn restart_task(&self, id: TaskId, job_handle: &str) -> Result<(), StoreError>;

    /// Reads the singleton accelerator-claim marker.
    async fn running_task(&self) -> Result<RunningTaskMarker, StoreError>;

    /// Overwrites the singleton accelerator-claim marker.
    async fn set_running_task(&self, marker: &RunningTaskMarker) -> Result<(), StoreError>;

    /// Replaces a dataset's generation metadata; `None` clears it.
    async fn set_generation_metadata(
        &self,
        dataset_id: DatasetId,
        metadata: Option<&GenerationMetadata>,
    ) -> Result<(), StoreError>;

    /// Appends one generated pair to a dataset.
    async fn append_generated_pair(
        &self,
        dataset_id: DatasetId,
        pair: &GeneratedPair,
    ) -> Result<(), StoreError>;

    /// Lists all deployment records.
    async fn list_deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Creates a deployment record for a container that just started.
    async fn create_deployment(
        &self,
        deployment: &NewDeployment,
    ) -> Result<DeploymentRecord, StoreError>;

    /// Deletes the deployment record for a model. Returns whether a record
    /// existed.
    async fn delete_deployment_for_model(&self, model_id: TaskId) -> Result<bool, StoreError>;

    /// Patches a model registry record (download status fields).
    async fn update_model_record(
        &self,
        model_id: ModelId,
        patch: &Value,
    ) -> Result<(), StoreError>;

    /// Pushes the worker host's hardware inventory.
    async fn update_hardware_info(&self, info: &HardwareInfo) -> Result<(), StoreError>;
}
