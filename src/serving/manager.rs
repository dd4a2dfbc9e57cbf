//! Serving lifecycle operations: start, stop, check.

use std::sync::Arc;

use tracing::info;

use super::runtime::{ContainerRuntime, ContainerState, ServingContainerSpec};
use super::ServingError;
use crate::config::AppConfig;
use crate::hardware;
use crate::paths::DataLayout;
use crate::store::{RecordStore, StoreError};
use crate::task::{DeploymentRecord, DeviceKind, NewDeployment, TaskId};

/// Lowest host port a deployment may publish on. The upper bound is the
/// u16 maximum, so only the floor needs checking.
const MIN_HOST_PORT: u16 = 1024;

/// Port the serving process listens on inside its container.
const SERVING_PORT: u16 = 8000;

/// Render device nodes passed through to every serving container.
const DEVICE_MOUNT: &str = "/dev/dri:/dev/dri";

/// Shared memory for the serving process (16 GiB).
const SHM_SIZE_BYTES: i64 = 16 * 1024 * 1024 * 1024;

/// Result of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServingHealth {
    /// The container was already up.
    Running,
    /// The container was stopped and has been restarted in place.
    Restarted,
}

/// Drives the serving container lifecycle against a [`ContainerRuntime`]
/// and keeps deployment records in step with it.
pub struct ServingManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn RecordStore>,
    config: AppConfig,
    layout: DataLayout,
}

impl ServingManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn RecordStore>,
        config: AppConfig,
    ) -> Self {
        let layout = DataLayout::new(config.data_root.clone());
        Self {
            runtime,
            store,
            config,
            layout,
        }
    }

    /// Starts serving a model. Always launches a fresh container; a
    /// stopped leftover is removed first, never resumed.
    ///
    /// Pre-flight order: weights on disk, host port, free memory,
    /// accelerator claim, image presence, existing container. The first
    /// failed check refuses the whole operation.
    pub async fn start(
        &self,
        model_id: TaskId,
        device: DeviceKind,
        host_address: &str,
        host_port: u16,
    ) -> Result<DeploymentRecord, ServingError> {
        let container_name = self.config.container_name(model_id);

        let weights = self.layout.serving_weights_dir(model_id);
        if !weights.is_dir() {
            return Err(ServingError::WeightsMissing(weights));
        }

        if host_port < MIN_HOST_PORT {
            return Err(ServingError::PortOutOfRange(host_port));
        }
        let deployments = self.store.list_deployments().await?;
        if let Some(existing) = deployments
            .iter()
            .find(|d| d.host_port == host_port && d.model_id != model_id)
        {
            return Err(ServingError::PortInUse {
                port: host_port,
                model_id: existing.model_id,
            });
        }

        let required_gb = self.config.training_reserve_gb + self.config.serving_memory_gb;
        let available_gb = hardware::available_memory_gb();
        if available_gb < required_gb {
            return Err(ServingError::InsufficientMemory {
                available_gb,
                required_gb,
            });
        }

        if device == DeviceKind::Xpu {
            self.ensure_accelerator_free().await?;
        }

        let image = self.config.serving_image_ref();
        if !self.runtime.image_present(&image).await? {
            return Err(ServingError::ImageMissing(image));
        }

        match self.runtime.container_state(&container_name).await? {
            ContainerState::Running => {
                return Err(ServingError::AlreadyRunning(container_name));
            }
            ContainerState::Stopped => {
                info!(model_id, container = %container_name, "stopped container found, recreating");
                self.runtime.remove_container(&container_name).await?;
                self.store.delete_deployment_for_model(model_id).await?;
            }
            ContainerState::Absent => {}
        }

        let spec = self.container_spec(model_id, device, host_port);
        self.runtime.run_container(&spec).await?;

        let record = self
            .store
            .create_deployment(&NewDeployment {
                model_id,
                host_address: host_address.to_string(),
                host_port,
                device,
            })
            .await?;

        info!(
            model_id,
            container = %container_name,
            host_port,
            device = %device,
            "serving container started"
        );
        Ok(record)
    }

    /// Stops serving a model: force-removes the container (absence is
    /// fine) and deletes the deployment record. Returns whether a record
    /// existed.
    pub async fn stop(&self, model_id: TaskId) -> Result<bool, ServingError> {
        let container_name = self.config.container_name(model_id);
        self.runtime.remove_container(&container_name).await?;

        let removed = self.store.delete_deployment_for_model(model_id).await?;
        info!(
            model_id,
            container = %container_name,
            record_removed = removed,
            "serving container stopped"
        );
        Ok(removed)
    }

    /// Health check: a stopped container is restarted in place, an absent
    /// one is reported missing and never implicitly created.
    pub async fn check(&self, model_id: TaskId) -> Result<ServingHealth, ServingError> {
        let container_name = self.config.container_name(model_id);
        match self.runtime.container_state(&container_name).await? {
            ContainerState::Running => Ok(ServingHealth::Running),
            ContainerState::Stopped => {
                info!(model_id, container = %container_name, "container stopped, restarting in place");
                self.runtime.restart_container(&container_name).await?;
                Ok(ServingHealth::Restarted)
            }
            ContainerState::Absent => Err(ServingError::ContainerMissing(container_name)),
        }
    }

    /// Refuses accelerator serving while a training task still claims the
    /// device. The marker is advisory; a claim whose task record is gone
    /// or already terminal does not block.
    async fn ensure_accelerator_free(&self) -> Result<(), ServingError> {
        let marker = self.store.running_task().await?;
        if !marker.is_claimed() {
            return Ok(());
        }
        let Some(task_id) = marker.task_id else {
            return Ok(());
        };
        match self.store.get_task(task_id).await {
            Ok(task) if !task.status.is_terminal() => {
                Err(ServingError::AcceleratorBusy { task_id })
            }
            Ok(_) => Ok(()),
            Err(StoreError::TaskNotFound(_)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    fn container_spec(
        &self,
        model_id: TaskId,
        device: DeviceKind,
        host_port: u16,
    ) -> ServingContainerSpec {
        let mut env = device_env(device);
        let model_path = self.layout.container_weights_path(model_id);
        env.push(format!("MODEL_PATH={model_path}"));
        env.push(format!("SERVED_MODEL_NAME={model_path}"));

        ServingContainerSpec {
            name: self.config.container_name(model_id),
            image: self.config.serving_image_ref(),
            hostname: format!("serving-node-{model_id}"),
            host_port,
            container_port: SERVING_PORT,
            env,
            network: self.config.docker_network.clone(),
            volume: self.config.docker_volume.clone(),
            devices: vec![DEVICE_MOUNT.to_string()],
            group_add: self.config.render_group_id.iter().cloned().collect(),
            privileged: true,
            shm_size_bytes: SHM_SIZE_BYTES,
        }
    }
}

/// OpenVINO environment profile per device. The two profiles are mutually
/// exclusive; the model path entries are appended afterwards.
fn device_env(device: DeviceKind) -> Vec<String> {
    match device {
        DeviceKind::Xpu => vec![
            "VLLM_OPENVINO_KVCACHE_SPACE=0".to_string(),
            "VLLM_OPENVINO_DEVICE=GPU".to_string(),
        ],
        DeviceKind::Cpu => vec![
            "VLLM_OPENVINO_KVCACHE_SPACE=0".to_string(),
            "VLLM_OPENVINO_CPU_KV_CACHE_PRECISION=None".to_string(),
        ],
    }
}
