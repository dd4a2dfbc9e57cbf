//! Base model downloads from the model hub.
//!
//! Registry models are pulled by shelling out to the configured hub CLI
//! rather than speaking the hub protocol here; the CLI already handles
//! resume, auth and mirror selection. The registry record tracks the
//! download through `download_metadata` patches and `is_downloaded` on
//! success.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

use crate::broker::JobHandle;
use crate::callback::CallbackClient;
use crate::config::AppConfig;
use crate::task::ModelId;

/// Checkpoint tensors excluded from every pull; serving only loads the
/// converted weights.
const EXCLUDE_PATTERN: &str = "*.pth";

/// Errors from a hub download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to launch model downloader {downloader}: {source}")]
    Spawn {
        downloader: PathBuf,
        source: std::io::Error,
    },

    #[error("model download exited with code {code}: {detail}")]
    NonZeroExit { code: i32, detail: String },

    #[error("model download was killed by a signal")]
    Interrupted,

    #[error("failed to prepare the model directory: {0}")]
    Io(#[from] std::io::Error),
}

/// Pulls base models into the shared model cache.
pub struct HubDownloader {
    callbacks: CallbackClient,
    downloader: PathBuf,
}

impl HubDownloader {
    pub fn new(callbacks: CallbackClient, config: &AppConfig) -> Self {
        Self {
            callbacks,
            downloader: config.model_downloader.clone(),
        }
    }

    /// Downloads one repo revision into `target_dir`.
    ///
    /// Marks the registry record as downloading up front and as downloaded
    /// on success; the failure patch belongs to the caller, which sees the
    /// returned error.
    pub async fn download(
        &self,
        handle: &JobHandle,
        model_id: ModelId,
        repo_id: &str,
        revision: &str,
        target_dir: &Path,
    ) -> Result<(), DownloadError> {
        self.callbacks
            .model_download_started(model_id, handle.as_str())
            .await;

        tokio::fs::create_dir_all(target_dir).await?;

        info!(
            model_id,
            repo_id,
            revision,
            dir = %target_dir.display(),
            "starting hub model download"
        );

        let output = Command::new(&self.downloader)
            .arg("download")
            .arg(repo_id)
            .arg("--revision")
            .arg(revision)
            .arg("--local-dir")
            .arg(target_dir)
            .arg("--exclude")
            .arg(EXCLUDE_PATTERN)
            .output()
            .await
            .map_err(|source| DownloadError::Spawn {
                downloader: self.downloader.clone(),
                source,
            })?;

        if output.status.success() {
            info!(model_id, repo_id, "model downloaded");
            self.callbacks.model_download_succeeded(model_id).await;
            return Ok(());
        }

        match output.status.code() {
            Some(code) => Err(DownloadError::NonZeroExit {
                code,
                detail: stderr_tail(&output.stderr),
            }),
            None => Err(DownloadError::Interrupted),
        }
    }
}

/// Last non-empty stderr line; hub CLIs end their output with the reason.
fn stderr_tail(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no stderr output")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRecordStore;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_cli(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("hub-cli");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn downloader_with(store: Arc<MemoryRecordStore>, cli: PathBuf) -> HubDownloader {
        let config = AppConfig::new().with_model_downloader(cli);
        HubDownloader::new(CallbackClient::new(store), &config)
    }

    #[tokio::test]
    async fn test_success_marks_model_downloaded() {
        let dir = TempDir::new().unwrap();
        let cli = write_cli(dir.path(), "exit 0");
        let store = Arc::new(MemoryRecordStore::new());
        let downloader = downloader_with(store.clone(), cli);

        downloader
            .download(
                &JobHandle::from("dl-1"),
                5,
                "mistralai/Mistral-7B-v0.1",
                "main",
                &dir.path().join("cache"),
            )
            .await
            .unwrap();

        let patches = store.model_patches_for(5);
        assert_eq!(patches.len(), 2);
        assert_eq!(patches[0]["download_metadata"]["status"], json!("DOWNLOADING"));
        assert_eq!(
            patches[0]["download_metadata"]["download_task_id"],
            json!("dl-1")
        );
        assert_eq!(patches[1]["is_downloaded"], json!(true));
        assert_eq!(patches[1]["download_metadata"]["progress"], json!(100));
    }

    #[tokio::test]
    async fn test_failure_surfaces_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let cli = write_cli(
            dir.path(),
            "echo 'fetching' >&2\necho 'repository not found' >&2\nexit 1",
        );
        let store = Arc::new(MemoryRecordStore::new());
        let downloader = downloader_with(store.clone(), cli);

        let error = downloader
            .download(
                &JobHandle::from("dl-2"),
                6,
                "acme/missing",
                "main",
                &dir.path().join("cache"),
            )
            .await
            .unwrap_err();

        match error {
            DownloadError::NonZeroExit { code, detail } => {
                assert_eq!(code, 1);
                assert_eq!(detail, "repository not found");
            }
            other => panic!("unexpected error: {other}"),
        }
        // Only the in-flight patch landed; the failure patch is the
        // caller's move once it sees the error.
        assert_eq!(store.model_patches_for(6).len(), 1);
    }

    #[tokio::test]
    async fn test_cli_receives_repo_revision_and_dir() {
        let dir = TempDir::new().unwrap();
        let args_out = dir.path().join("args.txt");
        let cli = write_cli(
            dir.path(),
            &format!("printf '%s\\n' \"$@\" > {}", args_out.display()),
        );
        let store = Arc::new(MemoryRecordStore::new());
        let downloader = downloader_with(store, cli);
        let target = dir.path().join("cache").join("mistral-7b");

        downloader
            .download(
                &JobHandle::from("dl-3"),
                7,
                "mistralai/Mistral-7B-v0.1",
                "abc123",
                &target,
            )
            .await
            .unwrap();

        let recorded = std::fs::read_to_string(&args_out).unwrap();
        let args: Vec<&str> = recorded.lines().collect();
        assert_eq!(
            args,
            vec![
                "download",
                "mistralai/Mistral-7B-v0.1",
                "--revision",
                "abc123",
                "--local-dir",
                target.to_str().unwrap(),
                "--exclude",
                "*.pth",
            ]
        );
        assert!(target.is_dir());
    }

    #[tokio::test]
    async fn test_spawn_failure_names_the_downloader() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryRecordStore::new());
        let downloader = downloader_with(store, dir.path().join("absent-cli"));

        let error = downloader
            .download(&JobHandle::from("dl-4"), 8, "a/b", "main", &dir.path().join("cache"))
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::Spawn { .. }));
        assert!(error.to_string().contains("absent-cli"));
    }
}
