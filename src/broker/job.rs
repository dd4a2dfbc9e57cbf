//! Job envelopes and typed payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use super::QueueName;
use crate::task::{DatasetId, ModelId, ProjectId, TaskId};

/// Opaque identifier of a queue job.
///
/// Handles are minted at publish time and travel with the task record, the
/// accelerator marker, abort flags and revocation flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Mints a fresh handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Typed job payload; the variant decides the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Fine-tune the model for a task using the config file on disk.
    ModelFinetuning {
        task_id: TaskId,
        config_path: PathBuf,
        #[serde(default = "default_num_gpus")]
        num_gpus: u32,
        #[serde(default)]
        resume_from_checkpoint: bool,
        #[serde(default = "default_true")]
        synthetic_generation: bool,
    },
    /// Generate synthetic pairs from a project's uploaded documents.
    DataGeneration {
        dataset_id: DatasetId,
        project_id: ProjectId,
        document_names: Vec<String>,
        num_generations: u32,
    },
    /// Generate synthetic pairs from one embedded source document.
    DocumentDataGeneration {
        dataset_id: DatasetId,
        project_id: ProjectId,
        source_filename: String,
        num_generations: u32,
    },
    /// Pull a base model from the hub into the local registry.
    DownloadModel {
        model_id: ModelId,
        repo_id: String,
        revision: String,
        target_dir: PathBuf,
    },
    /// Build the deployment archive for a finished task.
    PrepareDeploymentArchive {
        task_id: TaskId,
        project_id: ProjectId,
    },
    /// Push host inventory to the record store.
    UpdateHardwareInfo,
}

impl JobPayload {
    /// The queue this payload is published to.
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::ModelFinetuning { .. } => QueueName::Training,
            JobPayload::DataGeneration { .. } => QueueName::Dataset,
            JobPayload::DocumentDataGeneration { .. } => QueueName::Document,
            JobPayload::DownloadModel { .. } => QueueName::Common,
            JobPayload::PrepareDeploymentArchive { .. } => QueueName::Deployment,
            JobPayload::UpdateHardwareInfo => QueueName::Telemetry,
        }
    }

    /// Short payload kind for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            JobPayload::ModelFinetuning { .. } => "model_finetuning",
            JobPayload::DataGeneration { .. } => "data_generation",
            JobPayload::DocumentDataGeneration { .. } => "document_data_generation",
            JobPayload::DownloadModel { .. } => "download_model",
            JobPayload::PrepareDeploymentArchive { .. } => "prepare_deployment_archive",
            JobPayload::UpdateHardwareInfo => "update_hardware_info",
        }
    }
}

fn default_num_gpus() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// A published job: handle, payload and enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub handle: JobHandle,
    pub payload: JobPayload,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    /// Wraps a payload in a fresh envelope.
    pub fn new(payload: JobPayload) -> Self {
        Self {
            handle: JobHandle::new(),
            payload,
            enqueued_at: Utc::now(),
        }
    }

    /// How long the job has been in flight.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_routing() {
        let payload = JobPayload::ModelFinetuning {
            task_id: 1,
            config_path: PathBuf::from("/data/tasks/1/train.yml"),
            num_gpus: 1,
            resume_from_checkpoint: false,
            synthetic_generation: true,
        };
        assert_eq!(payload.queue(), QueueName::Training);
        assert_eq!(payload.kind(), "model_finetuning");

        assert_eq!(
            JobPayload::UpdateHardwareInfo.queue(),
            QueueName::Telemetry
        );
        assert_eq!(
            JobPayload::PrepareDeploymentArchive {
                task_id: 2,
                project_id: 1
            }
            .queue(),
            QueueName::Deployment
        );
    }

    #[test]
    fn test_payload_wire_format_is_tagged() {
        let payload = JobPayload::DownloadModel {
            model_id: 5,
            repo_id: "mistralai/Mistral-7B-v0.1".to_string(),
            revision: "main".to_string(),
            target_dir: PathBuf::from("/data/models/hf/mistral-7b"),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "download_model");
        assert_eq!(json["repo_id"], "mistralai/Mistral-7B-v0.1");
    }

    #[test]
    fn test_finetuning_launcher_knobs_default_on_old_envelopes() {
        let json = serde_json::json!({
            "kind": "model_finetuning",
            "task_id": 7,
            "config_path": "/data/tasks/7/models/train.yml"
        });
        let payload: JobPayload = serde_json::from_value(json).unwrap();
        match payload {
            JobPayload::ModelFinetuning {
                num_gpus,
                resume_from_checkpoint,
                synthetic_generation,
                ..
            } => {
                assert_eq!(num_gpus, 1);
                assert!(!resume_from_checkpoint);
                assert!(synthetic_generation);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn test_job_round_trip() {
        let job = Job::new(JobPayload::DataGeneration {
            dataset_id: 3,
            project_id: 1,
            document_names: vec!["guide.txt".to_string()],
            num_generations: 5,
        });
        let serialized = serde_json::to_string(&job).unwrap();
        let parsed: Job = serde_json::from_str(&serialized).unwrap();

        assert_eq!(parsed.handle, job.handle);
        assert_eq!(parsed.payload, job.payload);
    }

    #[test]
    fn test_handle_display_round_trip() {
        let handle = JobHandle::new();
        let recovered = JobHandle::from(handle.to_string());
        assert_eq!(handle, recovered);
    }
}
