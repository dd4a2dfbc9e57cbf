//! In-memory record store.
//!
//! Backs unit and integration tests and local dry runs. Unlike the HTTP
//! store, which trusts the server, this implementation enforces the
//! transition rules and the merge policy itself, making it the reference
//! for both.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{RecordStore, StoreError};
use crate::hardware::HardwareInfo;
use crate::task::{
    DatasetId, DeploymentRecord, GeneratedPair, GenerationMetadata, ModelId, NewDeployment,
    RunningTaskMarker, TaskId, TaskPatch, TaskRecord,
};

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<TaskId, TaskRecord>,
    marker: RunningTaskMarker,
    metadata: HashMap<DatasetId, GenerationMetadata>,
    pairs: HashMap<DatasetId, Vec<GeneratedPair>>,
    deployments: Vec<DeploymentRecord>,
    next_deployment_id: i64,
    model_patches: HashMap<ModelId, Vec<Value>>,
    hardware: Option<HardwareInfo>,
}

/// In-memory implementation of [`RecordStore`].
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a task record.
    pub fn insert_task(&self, task: TaskRecord) {
        self.lock().tasks.insert(task.id, task);
    }

    /// Seeds a deployment record; returns it with an assigned id.
    pub fn insert_deployment(&self, deployment: NewDeployment) -> DeploymentRecord {
        let mut inner = self.lock();
        inner.next_deployment_id += 1;
        let record = DeploymentRecord {
            id: inner.next_deployment_id,
            model_id: deployment.model_id,
            host_address: deployment.host_address,
            host_port: deployment.host_port,
            device: deployment.device,
            created_at: Utc::now(),
        };
        inner.deployments.push(record.clone());
        record
    }

    /// When set, every store call fails, simulating a record store outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns the pairs persisted for a dataset.
    pub fn pairs_for(&self, dataset_id: DatasetId) -> Vec<GeneratedPair> {
        self.lock().pairs.get(&dataset_id).cloned().unwrap_or_default()
    }

    /// Returns a dataset's current generation metadata, if any.
    pub fn metadata_for(&self, dataset_id: DatasetId) -> Option<GenerationMetadata> {
        self.lock().metadata.get(&dataset_id).cloned()
    }

    /// Returns the patches applied to a model registry record.
    pub fn model_patches_for(&self, model_id: ModelId) -> Vec<Value> {
        self.lock()
            .model_patches
            .get(&model_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the last pushed hardware inventory.
    pub fn hardware_info(&self) -> Option<HardwareInfo> {
        self.lock().hardware.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Request("simulated store outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_task(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.check_available()?;
        self.lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(id))
    }

    async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        if let Some(next) = patch.status {
            if !task.status.can_transition(next) {
                return Err(StoreError::IllegalTransition {
                    from: task.status,
                    to: next,
                });
            }
        }
        task.apply_patch(patch);
        Ok(())
    }

    async fn restart_task(&self, id: TaskId, job_handle: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::TaskNotFound(id))?;
        task.reset_for_restart(job_handle);
        Ok(())
    }

    async fn running_task(&self) -> Result<RunningTaskMarker, StoreError> {
        self.check_available()?;
        Ok(self.lock().marker.clone())
    }

    async fn set_running_task(&self, marker: &RunningTaskMarker) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().marker = marker.clone();
        Ok(())
    }

    async fn set_generation_metadata(
        &self,
        dataset_id: DatasetId,
        metadata: Option<&GenerationMetadata>,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        match metadata {
            Some(meta) => {
                inner.metadata.insert(dataset_id, meta.clone());
            }
            None => {
                inner.metadata.remove(&dataset_id);
            }
        }
        Ok(())
    }

    async fn append_generated_pair(
        &self,
        dataset_id: DatasetId,
        pair: &GeneratedPair,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock()
            .pairs
            .entry(dataset_id)
            .or_default()
            .push(pair.clone());
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        self.check_available()?;
        Ok(self.lock().deployments.clone())
    }

    async fn create_deployment(
        &self,
        deployment: &NewDeployment,
    ) -> Result<DeploymentRecord, StoreError> {
        self.check_available()?;
        Ok(self.insert_deployment(deployment.clone()))
    }

    async fn delete_deployment_for_model(&self, model_id: TaskId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.lock();
        let before = inner.deployments.len();
        inner.deployments.retain(|d| d.model_id != model_id);
        Ok(inner.deployments.len() != before)
    }

    async fn update_model_record(
        &self,
        model_id: ModelId,
        patch: &Value,
    ) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock()
            .model_patches
            .entry(model_id)
            .or_default()
            .push(patch.clone());
        Ok(())
    }

    async fn update_hardware_info(&self, info: &HardwareInfo) -> Result<(), StoreError> {
        self.check_available()?;
        self.lock().hardware = Some(info.clone());
        Ok(())
    }
}
