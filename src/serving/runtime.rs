//! Container runtime abstraction and its Docker implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    RestartContainerOptions, StartContainerOptions,
};
use bollard::models::{DeviceMapping, HostConfig, PortBinding};
use bollard::Docker;
use thiserror::Error;
use tracing::warn;

/// Hard ceiling on any single runtime call.
const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the container runtime itself, as opposed to lifecycle
/// refusals which live in [`super::ServingError`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime call timed out: {operation}")]
    Timeout { operation: String },

    #[error("container runtime error: {0}")]
    Api(String),
}

/// Observed state of a named container. Queried fresh on every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Absent,
    Stopped,
    Running,
}

/// Launch parameters for one serving container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServingContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    /// Host-side port published for the serving API.
    pub host_port: u16,
    /// Port the serving process listens on inside the container.
    pub container_port: u16,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    pub network: String,
    /// `volume:mountpoint` bind for the shared data cache.
    pub volume: String,
    /// `host:container[:permissions]` device bindings.
    pub devices: Vec<String>,
    /// Supplementary groups, e.g. the render group for `/dev/dri` access.
    pub group_add: Vec<String>,
    pub privileged: bool,
    pub shm_size_bytes: i64,
}

/// Minimal surface of a container engine the lifecycle manager needs.
///
/// Implementations must bound every call; a stuck daemon surfaces as
/// [`RuntimeError::Timeout`], never as a hang.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the image is available locally.
    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Current state of the named container.
    async fn container_state(&self, name: &str) -> Result<ContainerState, RuntimeError>;

    /// Creates and starts a container from the spec.
    async fn run_container(&self, spec: &ServingContainerSpec) -> Result<(), RuntimeError>;

    /// Restarts an existing container in place.
    async fn restart_container(&self, name: &str) -> Result<(), RuntimeError>;

    /// Force-removes the named container. Absence is not an error.
    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError>;
}

/// [`ContainerRuntime`] backed by the local Docker daemon.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(|error| {
            RuntimeError::Api(format!("failed to connect to Docker daemon: {error}"))
        })?;
        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        let inspect = tokio::time::timeout(RUNTIME_CALL_TIMEOUT, self.docker.inspect_image(image))
            .await
            .map_err(|_| timeout_error("inspect image"))?;
        Ok(inspect.is_ok())
    }

    async fn container_state(&self, name: &str) -> Result<ContainerState, RuntimeError> {
        let inspect = tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            self.docker
                .inspect_container(name, None::<InspectContainerOptions>),
        )
        .await
        .map_err(|_| timeout_error("inspect container"))?;

        match inspect {
            Ok(details) => {
                let running = details.state.and_then(|state| state.running).unwrap_or(false);
                Ok(if running {
                    ContainerState::Running
                } else {
                    ContainerState::Stopped
                })
            }
            Err(error) if is_not_found(&error) => Ok(ContainerState::Absent),
            Err(error) => Err(RuntimeError::Api(format!("inspect container: {error}"))),
        }
    }

    async fn run_container(&self, spec: &ServingContainerSpec) -> Result<(), RuntimeError> {
        let container_port = format!("{}/tcp", spec.container_port);
        let port_bindings = HashMap::from([(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);

        let host_config = HostConfig {
            privileged: Some(spec.privileged),
            shm_size: Some(spec.shm_size_bytes),
            network_mode: Some(spec.network.clone()),
            binds: Some(vec![spec.volume.clone()]),
            port_bindings: Some(port_bindings),
            devices: Some(spec.devices.iter().map(|d| device_mapping(d)).collect()),
            group_add: if spec.group_add.is_empty() {
                None
            } else {
                Some(spec.group_add.clone())
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            hostname: Some(spec.hostname.clone()),
            env: Some(spec.env.clone()),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            self.docker.create_container(Some(options), config),
        )
        .await
        .map_err(|_| timeout_error("create container"))?
        .map_err(|error| RuntimeError::Api(format!("create container: {error}")))?;

        tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            self.docker
                .start_container(&spec.name, None::<StartContainerOptions<String>>),
        )
        .await
        .map_err(|_| timeout_error("start container"))?
        .map_err(|error| RuntimeError::Api(format!("start container: {error}")))?;

        Ok(())
    }

    async fn restart_container(&self, name: &str) -> Result<(), RuntimeError> {
        tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            self.docker
                .restart_container(name, None::<RestartContainerOptions>),
        )
        .await
        .map_err(|_| timeout_error("restart container"))?
        .map_err(|error| RuntimeError::Api(format!("restart container: {error}")))
    }

    async fn remove_container(&self, name: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };

        let removal = tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            self.docker.remove_container(name, Some(options)),
        )
        .await
        .map_err(|_| timeout_error("remove container"))?;

        match removal {
            Ok(()) => Ok(()),
            Err(error) if is_not_found(&error) => {
                warn!(container = name, "container not found, nothing to remove");
                Ok(())
            }
            Err(error) => Err(RuntimeError::Api(format!("remove container: {error}"))),
        }
    }
}

fn timeout_error(operation: &str) -> RuntimeError {
    RuntimeError::Timeout {
        operation: operation.to_string(),
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Parses a `host:container[:permissions]` device binding.
fn device_mapping(binding: &str) -> DeviceMapping {
    let mut parts = binding.splitn(3, ':');
    let host = parts.next().unwrap_or(binding);
    let container = parts.next().unwrap_or(host);
    let permissions = parts.next().unwrap_or("rwm");
    DeviceMapping {
        path_on_host: Some(host.to_string()),
        path_in_container: Some(container.to_string()),
        cgroup_permissions: Some(permissions.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_mapping_two_part_binding() {
        let mapping = device_mapping("/dev/dri:/dev/dri");
        assert_eq!(mapping.path_on_host.as_deref(), Some("/dev/dri"));
        assert_eq!(mapping.path_in_container.as_deref(), Some("/dev/dri"));
        assert_eq!(mapping.cgroup_permissions.as_deref(), Some("rwm"));
    }

    #[test]
    fn test_device_mapping_bare_path() {
        let mapping = device_mapping("/dev/kvm");
        assert_eq!(mapping.path_on_host.as_deref(), Some("/dev/kvm"));
        assert_eq!(mapping.path_in_container.as_deref(), Some("/dev/kvm"));
    }

    #[test]
    fn test_device_mapping_explicit_permissions() {
        let mapping = device_mapping("/dev/dri:/dev/dri:rw");
        assert_eq!(mapping.cgroup_permissions.as_deref(), Some("rw"));
    }
}
