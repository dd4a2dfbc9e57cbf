//! Fire-and-forget state-transition callbacks.
//!
//! Jobs report lifecycle transitions through this client rather than the
//! store directly. Every notification returns a bool telling the caller
//! whether delivery was attempted successfully; a failed delivery is logged
//! at WARN and never retried, and must never fail the job that emitted it.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

use crate::hardware::HardwareInfo;
use crate::store::RecordStore;
use crate::task::{
    DatasetId, GenerationMetadata, ModelId, RunningTaskMarker, TaskId, TaskPatch, TaskStatus,
};

/// Notification client wrapping the record store.
#[derive(Clone)]
pub struct CallbackClient {
    store: Arc<dyn RecordStore>,
}

impl CallbackClient {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Access to the wrapped store for calls that must not be
    /// fire-and-forget (data persistence, reads).
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Training before-start hook: claims the accelerator marker and moves
    /// the task to `STARTED` in one notification.
    pub async fn training_started(&self, task_id: TaskId, job_handle: &str) -> bool {
        let marker = RunningTaskMarker::claimed(task_id, job_handle);
        let marker_ok = match self.store.set_running_task(&marker).await {
            Ok(()) => true,
            Err(error) => {
                warn!(task_id, error = %error, "failed to write running-task marker");
                false
            }
        };
        let patch = TaskPatch::status(TaskStatus::Started).with_job_handle(job_handle);
        self.patch_task(task_id, &patch, "task start").await && marker_ok
    }

    /// Publishes a human-readable stage breadcrumb into `results.stage`.
    pub async fn training_stage(&self, task_id: TaskId, stage: &str) -> bool {
        let patch = TaskPatch::default().with_result("stage", json!(stage));
        self.patch_task(task_id, &patch, "stage update").await
    }

    /// Training success hook; `results` (if any) merge into the record.
    pub async fn training_succeeded(
        &self,
        task_id: TaskId,
        results: Option<Map<String, Value>>,
    ) -> bool {
        let mut patch = TaskPatch::status(TaskStatus::Success);
        if let Some(results) = results {
            patch = patch.with_results(results);
        }
        self.patch_task(task_id, &patch, "task success").await
    }

    /// Training failure hook; the error text lands in `results.status`.
    pub async fn training_failed(&self, task_id: TaskId, error: &str) -> bool {
        let patch = TaskPatch::status(TaskStatus::Failure)
            .with_result("status", json!(format!("Training failure. Error: {error}")));
        self.patch_task(task_id, &patch, "task failure").await
    }

    /// Marks the deployment-archive build as started.
    pub async fn download_started(&self, task_id: TaskId) -> bool {
        self.patch_task(
            task_id,
            &TaskPatch::download(TaskStatus::Started, 0),
            "download start",
        )
        .await
    }

    /// Publishes archive build progress in integer percent.
    pub async fn download_progress(&self, task_id: TaskId, percent: u8) -> bool {
        self.patch_task(
            task_id,
            &TaskPatch::download(TaskStatus::Started, percent.min(100)),
            "download progress",
        )
        .await
    }

    /// Marks the deployment-archive build as finished.
    pub async fn download_succeeded(&self, task_id: TaskId) -> bool {
        self.patch_task(
            task_id,
            &TaskPatch::download(TaskStatus::Success, 100),
            "download success",
        )
        .await
    }

    /// Marks the deployment-archive build as failed.
    pub async fn download_failed(&self, task_id: TaskId) -> bool {
        self.patch_task(
            task_id,
            &TaskPatch::download(TaskStatus::Failure, 0),
            "download failure",
        )
        .await
    }

    /// Replaces a dataset's generation metadata; `None` clears it.
    pub async fn generation_metadata(
        &self,
        dataset_id: DatasetId,
        metadata: Option<&GenerationMetadata>,
    ) -> bool {
        match self.store.set_generation_metadata(dataset_id, metadata).await {
            Ok(()) => true,
            Err(error) => {
                warn!(dataset_id, error = %error, "failed to update generation metadata");
                false
            }
        }
    }

    /// Marks a registry model download as in flight.
    pub async fn model_download_started(&self, model_id: ModelId, job_handle: &str) -> bool {
        let patch = json!({
            "download_metadata": {
                "download_task_id": job_handle,
                "status": "DOWNLOADING",
                "progress": -1
            }
        });
        self.patch_model(model_id, &patch).await
    }

    /// Marks a registry model as downloaded.
    pub async fn model_download_succeeded(&self, model_id: ModelId) -> bool {
        let patch = json!({
            "is_downloaded": true,
            "download_metadata": {
                "download_task_id": null,
                "status": "SUCCESS",
                "progress": 100
            }
        });
        self.patch_model(model_id, &patch).await
    }

    /// Marks a registry model download as failed.
    pub async fn model_download_failed(&self, model_id: ModelId, error: &str) -> bool {
        warn!(model_id, error, "model download failed");
        let patch = json!({
            "is_downloaded": false,
            "download_metadata": {
                "download_task_id": null,
                "status": "FAILURE",
                "progress": -1
            }
        });
        self.patch_model(model_id, &patch).await
    }

    /// Pushes the host hardware inventory.
    pub async fn hardware_info(&self, info: &HardwareInfo) -> bool {
        match self.store.update_hardware_info(info).await {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %error, "failed to update hardware info");
                false
            }
        }
    }

    async fn patch_task(&self, task_id: TaskId, patch: &TaskPatch, what: &str) -> bool {
        match self.store.update_task(task_id, patch).await {
            Ok(()) => true,
            Err(error) => {
                warn!(task_id, error = %error, "failed to deliver {} callback", what);
                false
            }
        }
    }

    async fn patch_model(&self, model_id: ModelId, patch: &Value) -> bool {
        match self.store.update_model_record(model_id, patch).await {
            Ok(()) => true,
            Err(error) => {
                warn!(model_id, error = %error, "failed to patch model record");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use crate::task::TaskRecord;

    fn client_with(store: Arc<MemoryRecordStore>) -> CallbackClient {
        CallbackClient::new(store)
    }

    #[tokio::test]
    async fn test_training_started_sets_marker_and_status() {
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(1, 1, "QLORA"));
        let callbacks = client_with(store.clone());

        assert!(callbacks.training_started(1, "job-1").await);

        let task = store.get_task(1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Started);
        assert_eq!(task.job_handle.as_deref(), Some("job-1"));
        let marker = store.running_task().await.unwrap();
        assert_eq!(marker.task_id, Some(1));
        assert_eq!(marker.job_handle.as_deref(), Some("job-1"));
    }

    #[tokio::test]
    async fn test_training_failed_writes_error_into_results() {
        let store = Arc::new(MemoryRecordStore::new());
        let mut task = TaskRecord::new(2, 1, "QLORA");
        task.status = TaskStatus::Started;
        store.insert_task(task);
        let callbacks = client_with(store.clone());

        assert!(callbacks.training_failed(2, "exit code 137").await);

        let task = store.get_task(2).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failure);
        assert_eq!(
            task.results["status"],
            json!("Training failure. Error: exit code 137")
        );
    }

    #[tokio::test]
    async fn test_delivery_failure_returns_false_not_error() {
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(3, 1, "QLORA"));
        store.set_failing(true);
        let callbacks = client_with(store.clone());

        assert!(!callbacks.training_started(3, "job-3").await);
        assert!(!callbacks.download_succeeded(3).await);
        assert!(!callbacks.generation_metadata(9, None).await);
    }

    #[tokio::test]
    async fn test_download_progress_caps_at_100() {
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(4, 1, "QLORA"));
        let callbacks = client_with(store.clone());

        assert!(callbacks.download_progress(4, 250).await);

        let task = store.get_task(4).await.unwrap();
        assert_eq!(task.download_progress, 100);
        assert_eq!(task.download_status, Some(TaskStatus::Started));
    }

    #[tokio::test]
    async fn test_model_download_patches() {
        let store = Arc::new(MemoryRecordStore::new());
        let callbacks = client_with(store.clone());

        assert!(callbacks.model_download_started(11, "job-11").await);
        assert!(callbacks.model_download_failed(11, "no space").await);
        assert!(callbacks.model_download_succeeded(11).await);

        let patches = store.model_patches_for(11);
        assert_eq!(patches.len(), 3);
        assert_eq!(
            patches[0]["download_metadata"]["download_task_id"],
            json!("job-11")
        );
        assert_eq!(patches[0]["download_metadata"]["progress"], json!(-1));
        assert_eq!(patches[1]["is_downloaded"], json!(false));
        assert_eq!(patches[2]["is_downloaded"], json!(true));
        assert_eq!(
            patches[2]["download_metadata"]["download_task_id"],
            json!(null)
        );
    }
}
