//! Per-job execution: payload dispatch, outcome mapping, acknowledgement.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::abort::AbortController;
use crate::broker::{Job, JobBroker, JobHandle, JobPayload};
use crate::callback::CallbackClient;
use crate::config::AppConfig;
use crate::generation::{ChunkSource, GenerationOutcome, GenerationPipeline};
use crate::hardware;
use crate::hub::HubDownloader;
use crate::llm::{LlmProvider, SyntheticGenerator};
use crate::metrics;
use crate::packaging::{ArchivePackager, PackagingOutcome};
use crate::store::RecordStore;
use crate::task::{DatasetId, ModelId, ProjectId, TaskId, TaskStatus};
use crate::training::{BrokerRevocation, TrainingOptions, TrainingOutcome, TrainingRunner};

/// Shared dependency bundle handed to every worker.
///
/// Construction wires the runners once; clones share them. Everything here
/// is either a connection handle or an `Arc`, so cloning is cheap.
#[derive(Clone)]
pub struct WorkerContext {
    pub broker: JobBroker,
    pub store: Arc<dyn RecordStore>,
    pub callbacks: CallbackClient,
    pub aborts: AbortController,
    pub config: AppConfig,
    trainer: Arc<TrainingRunner>,
    pipeline: Arc<GenerationPipeline>,
    packager: Arc<ArchivePackager>,
    downloader: Arc<HubDownloader>,
}

impl WorkerContext {
    /// Wires the full worker dependency graph from its leaf services.
    pub fn new(
        broker: JobBroker,
        store: Arc<dyn RecordStore>,
        chunks: Arc<dyn ChunkSource>,
        llm: Arc<dyn LlmProvider>,
        config: AppConfig,
    ) -> Self {
        let callbacks = CallbackClient::new(Arc::clone(&store));
        let aborts = AbortController::new(broker.connection());
        let trainer = Arc::new(TrainingRunner::new(callbacks.clone(), &config));
        let generator = SyntheticGenerator::from_config(llm, &config);
        let pipeline = Arc::new(GenerationPipeline::new(callbacks.clone(), chunks, generator));
        let packager = Arc::new(ArchivePackager::from_config(callbacks.clone(), &config));
        let downloader = Arc::new(HubDownloader::new(callbacks.clone(), &config));
        Self {
            broker,
            store,
            callbacks,
            aborts,
            config,
            trainer,
            pipeline,
            packager,
            downloader,
        }
    }
}

/// How one job run ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// A cooperative abort was observed; the task record already says
    /// `REVOKED`, the run itself wound down cleanly.
    Aborted,
    /// The revocation flag killed the job mid-run.
    Revoked,
    Failed(String),
}

impl JobOutcome {
    /// Broker job-state value recorded for this outcome.
    ///
    /// An aborted run maps to `SUCCESS`: the worker function returned
    /// normally, and the task-record side of the story was already
    /// written by the abort path.
    pub fn broker_state(&self) -> TaskStatus {
        match self {
            JobOutcome::Completed | JobOutcome::Aborted => TaskStatus::Success,
            JobOutcome::Revoked => TaskStatus::Revoked,
            JobOutcome::Failed(_) => TaskStatus::Failure,
        }
    }

    /// Metrics label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Aborted => "aborted",
            JobOutcome::Revoked => "revoked",
            JobOutcome::Failed(_) => "failed",
        }
    }
}

/// Runs dequeued jobs to completion.
///
/// `execute` is infallible by construction: every failure mode ends up in
/// the job's broker state, the task record and the logs rather than in a
/// return value, because a worker loop has nobody to propagate errors to.
pub struct JobExecutor {
    context: WorkerContext,
}

impl JobExecutor {
    pub fn new(context: WorkerContext) -> Self {
        Self { context }
    }

    /// Runs one job start to finish and acknowledges it.
    pub async fn execute(&self, job: &Job) {
        let started = Instant::now();
        let queue = job.payload.queue();
        info!(
            job_handle = %job.handle,
            kind = job.payload.kind(),
            queue = %queue,
            "job started"
        );

        if let Err(error) = self
            .context
            .broker
            .set_job_state(&job.handle, TaskStatus::Started)
            .await
        {
            warn!(job_handle = %job.handle, error = %error, "could not record job start");
        }

        let outcome = self.run_payload(&job.handle, &job.payload).await;

        if let Err(error) = self
            .context
            .broker
            .set_job_state(&job.handle, outcome.broker_state())
            .await
        {
            warn!(job_handle = %job.handle, error = %error, "could not record job outcome");
        }
        if let Err(error) = self.context.broker.acknowledge(job).await {
            warn!(job_handle = %job.handle, error = %error, "could not acknowledge job");
        }

        let duration = started.elapsed();
        metrics::record_job(queue, outcome.label(), duration);
        match &outcome {
            JobOutcome::Failed(reason) => error!(
                job_handle = %job.handle,
                kind = job.payload.kind(),
                duration_ms = duration.as_millis() as u64,
                reason = %reason,
                "job failed"
            ),
            _ => info!(
                job_handle = %job.handle,
                kind = job.payload.kind(),
                duration_ms = duration.as_millis() as u64,
                outcome = outcome.label(),
                "job finished"
            ),
        }
    }

    async fn run_payload(&self, handle: &JobHandle, payload: &JobPayload) -> JobOutcome {
        match payload {
            JobPayload::ModelFinetuning {
                task_id,
                config_path,
                num_gpus,
                resume_from_checkpoint,
                synthetic_generation,
            } => {
                let options = TrainingOptions {
                    num_gpus: *num_gpus,
                    resume_from_checkpoint: *resume_from_checkpoint,
                    synthetic_generation: *synthetic_generation,
                };
                self.run_training(handle, *task_id, config_path, options)
                    .await
            }
            JobPayload::DataGeneration {
                dataset_id,
                document_names,
                num_generations,
                ..
            } => {
                self.run_document_set_generation(handle, *dataset_id, document_names, *num_generations)
                    .await
            }
            JobPayload::DocumentDataGeneration {
                dataset_id,
                source_filename,
                num_generations,
                ..
            } => {
                self.run_source_generation(handle, *dataset_id, source_filename, *num_generations)
                    .await
            }
            JobPayload::DownloadModel {
                model_id,
                repo_id,
                revision,
                target_dir,
            } => {
                self.run_model_download(handle, *model_id, repo_id, revision, target_dir)
                    .await
            }
            JobPayload::PrepareDeploymentArchive {
                task_id,
                project_id,
            } => self.run_packaging(*task_id, *project_id).await,
            JobPayload::UpdateHardwareInfo => self.run_telemetry().await,
        }
    }

    /// Fine-tuning: storage pre-flight, then the training subprocess.
    ///
    /// The disk check runs on the worker because the worker owns the data
    /// volume the checkpoints land on.
    async fn run_training(
        &self,
        handle: &JobHandle,
        task_id: TaskId,
        config_path: &Path,
        options: TrainingOptions,
    ) -> JobOutcome {
        let floor = self.context.config.training_storage_floor_gb;
        if !hardware::storage_available(&self.context.config.data_root, floor) {
            let reason = format!(
                "insufficient storage for training: less than {floor} GB free on the data volume"
            );
            self.context.callbacks.training_failed(task_id, &reason).await;
            return JobOutcome::Failed(reason);
        }

        let revocation = BrokerRevocation::new(self.context.broker.clone(), handle.clone());
        match self
            .context
            .trainer
            .run(handle, task_id, config_path, &options, &revocation)
            .await
        {
            Ok(TrainingOutcome::Completed) => {
                self.context.callbacks.training_succeeded(task_id, None).await;
                JobOutcome::Completed
            }
            // the revoke path already moved the task record to REVOKED
            Ok(TrainingOutcome::Revoked) => JobOutcome::Revoked,
            Err(error) => {
                let reason = error.to_string();
                self.context.callbacks.training_failed(task_id, &reason).await;
                JobOutcome::Failed(reason)
            }
        }
    }

    async fn run_document_set_generation(
        &self,
        handle: &JobHandle,
        dataset_id: DatasetId,
        document_names: &[String],
        num_generations: u32,
    ) -> JobOutcome {
        let abort = self.context.aborts.token(handle);
        match self
            .context
            .pipeline
            .run_for_documents(handle, dataset_id, document_names, num_generations, &abort)
            .await
        {
            Ok(outcome) => generation_outcome(outcome),
            Err(error) => JobOutcome::Failed(error.to_string()),
        }
    }

    async fn run_source_generation(
        &self,
        handle: &JobHandle,
        dataset_id: DatasetId,
        source_filename: &str,
        num_generations: u32,
    ) -> JobOutcome {
        let abort = self.context.aborts.token(handle);
        match self
            .context
            .pipeline
            .run_for_source(handle, dataset_id, source_filename, num_generations, &abort)
            .await
        {
            Ok(outcome) => generation_outcome(outcome),
            Err(error) => JobOutcome::Failed(error.to_string()),
        }
    }

    async fn run_model_download(
        &self,
        handle: &JobHandle,
        model_id: ModelId,
        repo_id: &str,
        revision: &str,
        target_dir: &Path,
    ) -> JobOutcome {
        match self
            .context
            .downloader
            .download(handle, model_id, repo_id, revision, target_dir)
            .await
        {
            Ok(()) => JobOutcome::Completed,
            Err(error) => {
                let reason = error.to_string();
                self.context
                    .callbacks
                    .model_download_failed(model_id, &reason)
                    .await;
                JobOutcome::Failed(reason)
            }
        }
    }

    async fn run_packaging(&self, task_id: TaskId, project_id: ProjectId) -> JobOutcome {
        match self.context.packager.package(task_id, project_id).await {
            Ok(PackagingOutcome::Built { bytes_written, .. }) => {
                info!(task_id, bytes_written, "deployment archive built");
                JobOutcome::Completed
            }
            Ok(PackagingOutcome::UpToDate { .. }) => {
                info!(task_id, "deployment archive already up to date");
                JobOutcome::Completed
            }
            // the packager's failure callback already marked the download
            Err(error) => JobOutcome::Failed(error.to_string()),
        }
    }

    /// Pushes host inventory to the record store. Fire-and-forget: a
    /// failed push is logged inside the callback and the job completes.
    async fn run_telemetry(&self) -> JobOutcome {
        let info = hardware::collect_hardware_info();
        self.context.callbacks.hardware_info(&info).await;
        JobOutcome::Completed
    }
}

fn generation_outcome(outcome: GenerationOutcome) -> JobOutcome {
    let stats = outcome.stats();
    info!(
        pairs_persisted = stats.pairs_persisted,
        units_skipped = stats.units_skipped,
        units_failed = stats.units_failed,
        aborted = outcome.is_aborted(),
        "generation run finished"
    );
    if outcome.is_aborted() {
        JobOutcome::Aborted
    } else {
        JobOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::GenerationStats;

    #[test]
    fn test_outcome_to_broker_state() {
        assert_eq!(JobOutcome::Completed.broker_state(), TaskStatus::Success);
        assert_eq!(JobOutcome::Aborted.broker_state(), TaskStatus::Success);
        assert_eq!(JobOutcome::Revoked.broker_state(), TaskStatus::Revoked);
        assert_eq!(
            JobOutcome::Failed("boom".into()).broker_state(),
            TaskStatus::Failure
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(JobOutcome::Completed.label(), "completed");
        assert_eq!(JobOutcome::Aborted.label(), "aborted");
        assert_eq!(JobOutcome::Revoked.label(), "revoked");
        assert_eq!(JobOutcome::Failed("boom".into()).label(), "failed");
    }

    #[test]
    fn test_aborted_generation_is_not_a_failure() {
        let stats = GenerationStats {
            pairs_persisted: 3,
            units_skipped: 1,
            ..GenerationStats::default()
        };
        let outcome = generation_outcome(GenerationOutcome::Aborted(stats));
        assert_eq!(outcome, JobOutcome::Aborted);
        assert_eq!(outcome.broker_state(), TaskStatus::Success);
    }
}
