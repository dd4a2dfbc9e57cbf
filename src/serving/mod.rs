//! Container serving lifecycle.
//!
//! One container per deployed model, named deterministically from the model
//! id, joined to a fixed network and the shared data volume. `Start`
//! recreates rather than resumes so configuration drift in a stopped
//! container never survives; `Check` is the only path that restarts in
//! place. Every pre-flight refusal is a typed [`ServingError`].

mod manager;
mod runtime;

pub use manager::{ServingHealth, ServingManager};
pub use runtime::{
    ContainerRuntime, ContainerState, DockerRuntime, RuntimeError, ServingContainerSpec,
};

use std::path::PathBuf;
use thiserror::Error;

use crate::store::StoreError;
use crate::task::TaskId;

/// Errors and refusals from the serving lifecycle.
#[derive(Debug, Error)]
pub enum ServingError {
    #[error("model weights not found at {0}")]
    WeightsMissing(PathBuf),

    #[error("host port {0} is outside the allowed range 1024-65535")]
    PortOutOfRange(u16),

    #[error("host port {port} is already used by the deployment for model {model_id}")]
    PortInUse { port: u16, model_id: TaskId },

    #[error("not enough free memory: {available_gb} GB available, {required_gb} GB required")]
    InsufficientMemory { available_gb: u64, required_gb: u64 },

    #[error("accelerator is busy: training task {task_id} is still active")]
    AcceleratorBusy { task_id: TaskId },

    #[error("serving image {0} is not installed")]
    ImageMissing(String),

    #[error("serving container {0} is already running")]
    AlreadyRunning(String),

    #[error("no serving container exists for {0}")]
    ContainerMissing(String),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("record store request failed during serving operation: {0}")]
    Store(#[from] StoreError),
}
