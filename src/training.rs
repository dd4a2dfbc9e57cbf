//! Fine-tuning subprocess runner.
//!
//! The heavy lifting lives in the platform launcher script; this module
//! owns the lifecycle around it: the before-start hook, the config
//! pre-check, spawning the launcher, polling the revocation flag while it
//! runs and mapping the exit status to an outcome.
//!
//! Revocation is a kill, not a request: once the flag is seen the child
//! is terminated and the run reports [`TrainingOutcome::Revoked`]. The
//! task record was already moved to `REVOKED` by whoever set the flag, so
//! no failure callback fires on this path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::broker::{JobBroker, JobHandle};
use crate::callback::CallbackClient;
use crate::config::AppConfig;
use crate::paths::DataLayout;
use crate::task::TaskId;

/// Stage breadcrumb published when the launcher starts.
const STAGE_TRAINING: &str = "Training model";

/// Stage breadcrumb published after a clean exit.
const STAGE_COMPLETED: &str = "Training Completed";

/// Errors from a training run.
#[derive(Debug, Error)]
pub enum TrainingError {
    /// The training config written at dispatch is not on disk.
    #[error("training config not found at {0}")]
    ConfigMissing(PathBuf),

    /// The training config on disk is not parseable YAML.
    #[error("training config at {path} is not valid YAML: {source}")]
    ConfigInvalid {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("failed to launch training script {launcher}: {source}")]
    Spawn {
        launcher: PathBuf,
        source: std::io::Error,
    },

    #[error("training exited with code {code}; check the training log at {log}")]
    NonZeroExit { code: i32, log: PathBuf },

    #[error("training process was killed by a signal; check the training log at {log}")]
    Interrupted { log: PathBuf },

    #[error("waiting for the training process failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How a finished training run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingOutcome {
    /// The launcher exited cleanly.
    Completed,
    /// The revocation flag was set and the launcher killed.
    Revoked,
}

/// Launcher knobs carried by the training job payload.
#[derive(Debug, Clone)]
pub struct TrainingOptions {
    /// GPUs requested from the launcher.
    pub num_gpus: u32,
    /// Resume from the last checkpoint instead of starting fresh.
    pub resume_from_checkpoint: bool,
    /// Generate synthetic validation data before training.
    pub synthetic_generation: bool,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        Self {
            num_gpus: 1,
            resume_from_checkpoint: false,
            synthetic_generation: true,
        }
    }
}

/// Polled while the launcher runs to learn whether the job was revoked.
///
/// Transport errors read as "not revoked"; a flaky broker must not kill
/// a healthy training run.
#[async_trait]
pub trait RevocationProbe: Send + Sync {
    async fn is_revoked(&self) -> bool;
}

/// [`RevocationProbe`] backed by the broker's revocation flag.
pub struct BrokerRevocation {
    broker: JobBroker,
    handle: JobHandle,
}

impl BrokerRevocation {
    pub fn new(broker: JobBroker, handle: JobHandle) -> Self {
        Self { broker, handle }
    }
}

#[async_trait]
impl RevocationProbe for BrokerRevocation {
    async fn is_revoked(&self) -> bool {
        match self.broker.is_revoked(&self.handle).await {
            Ok(flag) => flag,
            Err(err) => {
                warn!(handle = %self.handle, error = %err, "revocation flag check failed, continuing");
                false
            }
        }
    }
}

/// Runs fine-tuning jobs through the platform launcher script.
pub struct TrainingRunner {
    callbacks: CallbackClient,
    layout: DataLayout,
    launcher: PathBuf,
    poll_interval: Duration,
}

impl TrainingRunner {
    pub fn new(callbacks: CallbackClient, config: &AppConfig) -> Self {
        Self {
            callbacks,
            layout: DataLayout::new(config.data_root.clone()),
            launcher: config.training_launcher.clone(),
            poll_interval: config.revocation_poll_interval,
        }
    }

    /// Runs one training job to completion, revocation or failure.
    ///
    /// Fires the before-start hook (accelerator marker + `STARTED`), then
    /// hands `config_path` to the launcher together with the log path and
    /// the option flags. The launcher owns everything from there; this
    /// side only watches the exit status and the revocation flag.
    pub async fn run(
        &self,
        handle: &JobHandle,
        task_id: TaskId,
        config_path: &Path,
        options: &TrainingOptions,
        revocation: &dyn RevocationProbe,
    ) -> Result<TrainingOutcome, TrainingError> {
        self.callbacks.training_started(task_id, handle.as_str()).await;

        if !config_path.is_file() {
            return Err(TrainingError::ConfigMissing(config_path.to_path_buf()));
        }
        // the trainer behind the launcher requires well-formed YAML
        let raw = tokio::fs::read_to_string(config_path).await?;
        if let Err(source) = serde_yaml::from_str::<serde_yaml::Value>(&raw) {
            return Err(TrainingError::ConfigInvalid {
                path: config_path.to_path_buf(),
                source,
            });
        }

        let log_path = self.layout.train_log(task_id);
        self.callbacks.training_stage(task_id, STAGE_TRAINING).await;
        info!(
            task_id,
            launcher = %self.launcher.display(),
            log = %log_path.display(),
            "training starting, check the training log for launcher output"
        );

        let mut child = Command::new(&self.launcher)
            .arg(config_path)
            .arg(options.num_gpus.to_string())
            .arg(&log_path)
            .arg(flag(options.resume_from_checkpoint))
            .arg(flag(options.synthetic_generation))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TrainingError::Spawn {
                launcher: self.launcher.clone(),
                source,
            })?;

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; consume it so revocation
        // checks land on interval boundaries.
        poll.tick().await;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = poll.tick() => {
                    if revocation.is_revoked().await {
                        info!(task_id, handle = %handle, "revocation flag set, killing training process");
                        let _ = child.kill().await;
                        return Ok(TrainingOutcome::Revoked);
                    }
                }
            }
        };

        match status.code() {
            Some(0) => {
                self.callbacks.training_stage(task_id, STAGE_COMPLETED).await;
                info!(task_id, "training completed");
                Ok(TrainingOutcome::Completed)
            }
            Some(code) => {
                error!(task_id, code, "training launcher ended with a non-zero exit code");
                Err(TrainingError::NonZeroExit {
                    code,
                    log: log_path,
                })
            }
            None => Err(TrainingError::Interrupted { log: log_path }),
        }
    }
}

fn flag(on: bool) -> &'static str {
    if on {
        "1"
    } else {
        "0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryRecordStore, RecordStore};
    use crate::task::{TaskRecord, TaskStatus};
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct ManualRevocation {
        flag: Arc<AtomicBool>,
    }

    impl ManualRevocation {
        fn trigger(&self) {
            self.flag.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl RevocationProbe for ManualRevocation {
        async fn is_revoked(&self) -> bool {
            self.flag.load(Ordering::SeqCst)
        }
    }

    fn write_launcher(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("train.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn seed_train_config(root: &Path, task_id: TaskId) -> PathBuf {
        let config_path = DataLayout::new(root).train_config(task_id);
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, "model_args:\n  task_type: QLORA\n").unwrap();
        config_path
    }

    fn runner_with(
        store: Arc<MemoryRecordStore>,
        root: &Path,
        launcher: PathBuf,
    ) -> TrainingRunner {
        let config = AppConfig::new()
            .with_data_root(root)
            .with_training_launcher(launcher)
            .with_revocation_poll_interval(Duration::from_secs(1));
        TrainingRunner::new(CallbackClient::new(store), &config)
    }

    #[tokio::test]
    async fn test_refuses_when_train_config_missing() {
        let dir = TempDir::new().unwrap();
        let launcher = write_launcher(dir.path(), "exit 0");
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(1, 1, "QLORA"));
        let runner = runner_with(store.clone(), dir.path(), launcher);

        let missing = DataLayout::new(dir.path()).train_config(1);
        let result = runner
            .run(
                &JobHandle::from("job-1"),
                1,
                &missing,
                &TrainingOptions::default(),
                &ManualRevocation::default(),
            )
            .await;

        assert!(matches!(result, Err(TrainingError::ConfigMissing(_))));
        // The before-start hook fires before the pre-check, so the task is
        // already STARTED; the executor flips it to FAILURE.
        let task = store.get_task(1).await.unwrap();
        assert_eq!(task.status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn test_refuses_a_config_that_is_not_yaml() {
        let dir = TempDir::new().unwrap();
        let launcher = write_launcher(dir.path(), "exit 0");
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(8, 1, "QLORA"));
        let runner = runner_with(store.clone(), dir.path(), launcher);

        let config_path = DataLayout::new(dir.path()).train_config(8);
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, "model_args: [unterminated\n").unwrap();

        let result = runner
            .run(
                &JobHandle::from("job-8"),
                8,
                &config_path,
                &TrainingOptions::default(),
                &ManualRevocation::default(),
            )
            .await;

        assert!(matches!(result, Err(TrainingError::ConfigInvalid { .. })));
    }

    #[tokio::test]
    async fn test_clean_exit_completes_and_publishes_stage() {
        let dir = TempDir::new().unwrap();
        let launcher = write_launcher(dir.path(), "exit 0");
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(2, 1, "QLORA"));
        let runner = runner_with(store.clone(), dir.path(), launcher);
        let config_path = seed_train_config(dir.path(), 2);

        let outcome = runner
            .run(
                &JobHandle::from("job-2"),
                2,
                &config_path,
                &TrainingOptions::default(),
                &ManualRevocation::default(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, TrainingOutcome::Completed);
        let task = store.get_task(2).await.unwrap();
        assert_eq!(task.status, TaskStatus::Started);
        assert_eq!(task.results["stage"], serde_json::json!("Training Completed"));
        let marker = store.running_task().await.unwrap();
        assert_eq!(marker.task_id, Some(2));
        assert_eq!(marker.job_handle.as_deref(), Some("job-2"));
    }

    #[tokio::test]
    async fn test_launcher_receives_config_gpus_log_and_flags() {
        let dir = TempDir::new().unwrap();
        let args_out = dir.path().join("args.txt");
        let launcher = write_launcher(
            dir.path(),
            &format!("printf '%s\\n' \"$@\" > {}", args_out.display()),
        );
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(3, 1, "LORA"));
        let runner = runner_with(store.clone(), dir.path(), launcher);
        let config_path = seed_train_config(dir.path(), 3);

        let options = TrainingOptions {
            num_gpus: 2,
            resume_from_checkpoint: true,
            synthetic_generation: false,
        };
        runner
            .run(
                &JobHandle::from("job-3"),
                3,
                &config_path,
                &options,
                &ManualRevocation::default(),
            )
            .await
            .unwrap();

        let recorded = std::fs::read_to_string(&args_out).unwrap();
        let args: Vec<&str> = recorded.lines().collect();
        let log_path = DataLayout::new(dir.path()).train_log(3);
        assert_eq!(
            args,
            vec![
                config_path.to_str().unwrap(),
                "2",
                log_path.to_str().unwrap(),
                "1",
                "0",
            ]
        );
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_code_and_log_pointer() {
        let dir = TempDir::new().unwrap();
        let launcher = write_launcher(dir.path(), "exit 3");
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(4, 1, "QLORA"));
        let runner = runner_with(store.clone(), dir.path(), launcher);
        let config_path = seed_train_config(dir.path(), 4);

        let error = runner
            .run(
                &JobHandle::from("job-4"),
                4,
                &config_path,
                &TrainingOptions::default(),
                &ManualRevocation::default(),
            )
            .await
            .unwrap_err();

        match error {
            TrainingError::NonZeroExit { code, log } => {
                assert_eq!(code, 3);
                assert!(log.ends_with("train.log"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_revocation_kills_the_launcher() {
        let dir = TempDir::new().unwrap();
        let launcher = write_launcher(dir.path(), "sleep 30");
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(5, 1, "QLORA"));

        let config = AppConfig::new()
            .with_data_root(dir.path())
            .with_training_launcher(launcher)
            .with_revocation_poll_interval(Duration::from_millis(50));
        let runner = TrainingRunner::new(CallbackClient::new(store.clone()), &config);
        let config_path = seed_train_config(dir.path(), 5);

        let revocation = ManualRevocation::default();
        revocation.trigger();

        let started = std::time::Instant::now();
        let outcome = runner
            .run(
                &JobHandle::from("job-5"),
                5,
                &config_path,
                &TrainingOptions::default(),
                &revocation,
            )
            .await
            .unwrap();

        assert_eq!(outcome, TrainingOutcome::Revoked);
        assert!(started.elapsed() < Duration::from_secs(10));
        // No failure callback on the revocation path.
        let task = store.get_task(5).await.unwrap();
        assert_eq!(task.status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn test_spawn_failure_names_the_launcher() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        store.insert_task(TaskRecord::new(6, 1, "QLORA"));
        let runner = runner_with(
            store,
            dir.path(),
            dir.path().join("no-such-launcher.sh"),
        );
        let config_path = seed_train_config(dir.path(), 6);

        let error = runner
            .run(
                &JobHandle::from("job-6"),
                6,
                &config_path,
                &TrainingOptions::default(),
                &ManualRevocation::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, TrainingError::Spawn { .. }));
        assert!(error.to_string().contains("no-such-launcher.sh"));
    }
}
