//! Archive assembly and the size-sum currency check.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::mpsc;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::progress::ProgressTracker;
use super::PackagingError;
use crate::callback::CallbackClient;
use crate::config::AppConfig;
use crate::paths::DataLayout;
use crate::task::{ProjectId, TaskId};

/// Archive prefix for model weight files.
const WEIGHTS_PREFIX: &str = "data/models/llm";
/// Archive prefix for the vector-embedding store.
const EMBEDDINGS_PREFIX: &str = "data/embeddings";

/// The three source trees bundled into a deployment archive.
#[derive(Debug, Clone)]
pub struct ArchiveSources {
    /// Fine-tuned weights, flattened under [`WEIGHTS_PREFIX`]. Required.
    pub weights_dir: PathBuf,
    /// Static serving assets, kept at the archive root. Required.
    pub assets_dir: PathBuf,
    /// Vector-embedding store, kept under [`EMBEDDINGS_PREFIX`]. Optional.
    pub embeddings_dir: PathBuf,
}

impl ArchiveSources {
    pub fn for_task(
        layout: &DataLayout,
        assets_dir: &Path,
        task_id: TaskId,
        project_id: ProjectId,
    ) -> Self {
        Self {
            weights_dir: layout.weights_dir(task_id),
            assets_dir: assets_dir.to_path_buf(),
            embeddings_dir: layout.embeddings_dir(project_id),
        }
    }

    /// Resolves the trees into concrete archive entries. The weights and
    /// assets trees must exist; a missing embeddings tree only warns.
    fn collect(&self) -> Result<Vec<ArchiveEntry>, PackagingError> {
        if !self.weights_dir.is_dir() {
            return Err(PackagingError::MissingWeights(self.weights_dir.clone()));
        }
        if !self.assets_dir.is_dir() {
            return Err(PackagingError::MissingAssets(self.assets_dir.clone()));
        }

        let mut entries = Vec::new();
        for entry in files_under(&self.weights_dir) {
            let entry = entry?;
            entries.push(ArchiveEntry {
                name: Path::new(WEIGHTS_PREFIX).join(entry.file_name()),
                size: entry.metadata()?.len(),
                path: entry.into_path(),
            });
        }
        for entry in files_under(&self.assets_dir) {
            let entry = entry?;
            let relative = entry.path().strip_prefix(&self.assets_dir).unwrap_or(entry.path());
            entries.push(ArchiveEntry {
                name: relative.to_path_buf(),
                size: entry.metadata()?.len(),
                path: entry.into_path(),
            });
        }
        if self.embeddings_dir.is_dir() {
            for entry in files_under(&self.embeddings_dir) {
                let entry = entry?;
                let relative = entry
                    .path()
                    .strip_prefix(&self.embeddings_dir)
                    .unwrap_or(entry.path());
                entries.push(ArchiveEntry {
                    name: Path::new(EMBEDDINGS_PREFIX).join(relative),
                    size: entry.metadata()?.len(),
                    path: entry.into_path(),
                });
            }
        } else {
            warn!(
                embeddings_dir = %self.embeddings_dir.display(),
                "deployment has no embedding store, archiving without it"
            );
        }

        Ok(entries)
    }
}

/// One file scheduled for the archive.
#[derive(Debug)]
struct ArchiveEntry {
    path: PathBuf,
    name: PathBuf,
    size: u64,
}

/// How a packaging run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackagingOutcome {
    /// A fresh archive was written.
    Built {
        archive_path: PathBuf,
        bytes_written: u64,
    },
    /// The existing archive already matches the sources; nothing was done.
    UpToDate { archive_path: PathBuf },
}

impl PackagingOutcome {
    pub fn archive_path(&self) -> &Path {
        match self {
            PackagingOutcome::Built { archive_path, .. }
            | PackagingOutcome::UpToDate { archive_path } => archive_path,
        }
    }
}

/// Builds the archive at `archive_path` from `sources`, invoking
/// `on_progress` with each new integer percentage.
///
/// When an archive already exists and the sum of its uncompressed entry
/// sizes equals the sum of the current source file sizes, the rebuild is
/// skipped. This is a byte-count heuristic, not a content hash; an edit
/// that preserves the total size goes unnoticed.
pub fn package_archive(
    sources: &ArchiveSources,
    archive_path: &Path,
    mut on_progress: impl FnMut(u8),
) -> Result<PackagingOutcome, PackagingError> {
    let entries = sources.collect()?;
    let source_total: u64 = entries.iter().map(|entry| entry.size).sum();

    if archive_path.exists() {
        match archive_entry_size_sum(archive_path) {
            Some(existing_total) if existing_total == source_total => {
                info!(
                    archive = %archive_path.display(),
                    total_bytes = source_total,
                    "archive already matches sources, skipping rebuild"
                );
                return Ok(PackagingOutcome::UpToDate {
                    archive_path: archive_path.to_path_buf(),
                });
            }
            Some(_) => {}
            None => {
                warn!(
                    archive = %archive_path.display(),
                    "existing archive is unreadable, rebuilding"
                );
            }
        }
    }

    if let Some(parent) = archive_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut tracker = ProgressTracker::new(source_total);
    let encoder = GzEncoder::new(File::create(archive_path)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for entry in &entries {
        let mut file = File::open(&entry.path)?;
        builder.append_file(&entry.name, &mut file)?;
        if let Some(percent) = tracker.advance(entry.size) {
            on_progress(percent);
        }
    }
    builder.into_inner()?.finish()?;

    info!(
        archive = %archive_path.display(),
        files = entries.len(),
        total_bytes = source_total,
        "deployment archive built"
    );
    Ok(PackagingOutcome::Built {
        archive_path: archive_path.to_path_buf(),
        bytes_written: source_total,
    })
}

/// Sum of the uncompressed entry sizes in an existing archive, or `None`
/// when the archive cannot be read.
fn archive_entry_size_sum(path: &Path) -> Option<u64> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path).ok()?));
    let mut total = 0u64;
    for entry in archive.entries().ok()? {
        let entry = entry.ok()?;
        if entry.header().entry_type().is_file() {
            total += entry.header().size().ok()?;
        }
    }
    Some(total)
}

fn files_under(dir: &Path) -> impl Iterator<Item = Result<walkdir::DirEntry, walkdir::Error>> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter(|entry| {
            entry
                .as_ref()
                .map(|e| e.file_type().is_file())
                .unwrap_or(true)
        })
}

/// Runs packaging jobs: builds the archive on a blocking thread and
/// mirrors its progress into the task record's download fields.
pub struct ArchivePackager {
    callbacks: CallbackClient,
    layout: DataLayout,
    assets_dir: PathBuf,
}

impl ArchivePackager {
    pub fn new(callbacks: CallbackClient, layout: DataLayout, assets_dir: PathBuf) -> Self {
        Self {
            callbacks,
            layout,
            assets_dir,
        }
    }

    pub fn from_config(callbacks: CallbackClient, config: &AppConfig) -> Self {
        Self::new(
            callbacks,
            DataLayout::new(config.data_root.clone()),
            config.assets_dir.clone(),
        )
    }

    /// Packages one task's deployment archive, driving the download
    /// status STARTED to SUCCESS or FAILURE around the build.
    pub async fn package(
        &self,
        task_id: TaskId,
        project_id: ProjectId,
    ) -> Result<PackagingOutcome, PackagingError> {
        let sources = ArchiveSources::for_task(&self.layout, &self.assets_dir, task_id, project_id);
        let archive_path = self.layout.archive_path(task_id);

        self.callbacks.download_started(task_id).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let build = tokio::task::spawn_blocking(move || {
            package_archive(&sources, &archive_path, |percent| {
                let _ = tx.send(percent);
            })
        });

        while let Some(percent) = rx.recv().await {
            self.callbacks.download_progress(task_id, percent).await;
        }

        match build.await {
            Ok(Ok(outcome)) => {
                self.callbacks.download_succeeded(task_id).await;
                Ok(outcome)
            }
            Ok(Err(error)) => {
                self.callbacks.download_failed(task_id).await;
                Err(error)
            }
            Err(join_error) => {
                self.callbacks.download_failed(task_id).await;
                Err(PackagingError::Worker(join_error.to_string()))
            }
        }
    }
}
