//! Deployment archive builder.
//!
//! Bundles a task's fine-tuned weights, the static deployment assets and
//! the project's vector-embedding store into one `tar.gz` that a serving
//! host can unpack and run. Builds are skipped when an existing archive
//! already matches the source trees, and progress is reported through the
//! task record's download fields.

mod archive;
mod progress;

pub use archive::{package_archive, ArchivePackager, ArchiveSources, PackagingOutcome};
pub use progress::ProgressTracker;

use std::path::PathBuf;
use thiserror::Error;

/// Errors from archive packaging.
#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("model weights directory not found: {0}")]
    MissingWeights(PathBuf),

    #[error("deployment assets directory not found: {0}")]
    MissingAssets(PathBuf),

    #[error("failed to scan source tree: {0}")]
    Scan(#[from] walkdir::Error),

    #[error("archive build failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("packaging worker thread failed: {0}")]
    Worker(String),
}
