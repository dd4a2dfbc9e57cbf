//! Filesystem layout of the shared data volume.
//!
//! Every worker and the serving manager see the same tree under one data
//! root. Serving containers mount the same volume at [`CONTAINER_DATA_ROOT`],
//! so container-side paths are host paths with the root swapped.
//!
//! ```text
//! data/
//!   tasks/{task_id}/
//!     models/
//!       train.yml              training config written at dispatch
//!       train.log              training subprocess log
//!       models/                raw fine-tuned weights
//!       checkpoints/ov_model/  converted weights served by containers
//!     model_serving_{task_id}.tar.gz
//!   projects/{project_id}/
//!     chroma/                  vector-embedding store
//!       documents/             uploaded source documents
//!   models/hf/                 downloaded base models
//! ```

use std::path::{Path, PathBuf};

use crate::task::{ProjectId, TaskId};

/// Mount point of the data volume inside serving containers.
pub const CONTAINER_DATA_ROOT: &str = "/llm-data";

/// Resolves paths under the shared data root.
#[derive(Debug, Clone)]
pub struct DataLayout {
    data_root: PathBuf,
}

impl DataLayout {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Per-task working directory.
    pub fn task_dir(&self, task_id: TaskId) -> PathBuf {
        self.data_root.join("tasks").join(task_id.to_string())
    }

    /// Training config consumed by the launcher.
    pub fn train_config(&self, task_id: TaskId) -> PathBuf {
        self.task_dir(task_id).join("models").join("train.yml")
    }

    /// Training subprocess log.
    pub fn train_log(&self, task_id: TaskId) -> PathBuf {
        self.task_dir(task_id).join("models").join("train.log")
    }

    /// Raw fine-tuned weights, the packager's model tree.
    pub fn weights_dir(&self, task_id: TaskId) -> PathBuf {
        self.task_dir(task_id).join("models").join("models")
    }

    /// Converted weights a serving container loads.
    pub fn serving_weights_dir(&self, task_id: TaskId) -> PathBuf {
        self.task_dir(task_id)
            .join("models")
            .join("checkpoints")
            .join("ov_model")
    }

    /// Target path of the deployment archive.
    pub fn archive_path(&self, task_id: TaskId) -> PathBuf {
        self.task_dir(task_id)
            .join(format!("model_serving_{task_id}.tar.gz"))
    }

    /// Per-project directory.
    pub fn project_dir(&self, project_id: ProjectId) -> PathBuf {
        self.data_root.join("projects").join(project_id.to_string())
    }

    /// Vector-embedding store, the packager's optional embeddings tree.
    pub fn embeddings_dir(&self, project_id: ProjectId) -> PathBuf {
        self.project_dir(project_id).join("chroma")
    }

    /// Uploaded source documents for a project.
    pub fn documents_dir(&self, project_id: ProjectId) -> PathBuf {
        self.embeddings_dir(project_id).join("documents")
    }

    /// Cache of downloaded base models.
    pub fn model_cache_dir(&self) -> PathBuf {
        self.data_root.join("models").join("hf")
    }

    /// The serving weights path as seen from inside a container.
    pub fn container_weights_path(&self, task_id: TaskId) -> String {
        format!("{CONTAINER_DATA_ROOT}/tasks/{task_id}/models/checkpoints/ov_model")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_paths() {
        let layout = DataLayout::new("./data");
        assert_eq!(
            layout.train_config(3),
            PathBuf::from("./data/tasks/3/models/train.yml")
        );
        assert_eq!(
            layout.weights_dir(3),
            PathBuf::from("./data/tasks/3/models/models")
        );
        assert_eq!(
            layout.serving_weights_dir(3),
            PathBuf::from("./data/tasks/3/models/checkpoints/ov_model")
        );
        assert_eq!(
            layout.archive_path(3),
            PathBuf::from("./data/tasks/3/model_serving_3.tar.gz")
        );
    }

    #[test]
    fn test_project_paths() {
        let layout = DataLayout::new("/srv/data");
        assert_eq!(
            layout.embeddings_dir(12),
            PathBuf::from("/srv/data/projects/12/chroma")
        );
        assert_eq!(
            layout.documents_dir(12),
            PathBuf::from("/srv/data/projects/12/chroma/documents")
        );
    }

    #[test]
    fn test_container_weights_path_uses_container_root() {
        let layout = DataLayout::new("/anywhere/on/host");
        assert_eq!(
            layout.container_weights_path(9),
            "/llm-data/tasks/9/models/checkpoints/ov_model"
        );
    }
}
