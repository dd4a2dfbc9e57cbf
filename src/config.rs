//! Runtime configuration for workers and the lifecycle manager.
//!
//! Covers service endpoints, data layout roots, generation LLM options,
//! serving container settings and the resource floors enforced before
//! dispatching or serving work.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration shared by worker pools, the packager and the serving
/// lifecycle manager.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Service endpoints
    /// Base URL of the record store HTTP API.
    pub api_url: String,
    /// Redis URL backing the job broker and abort flags.
    pub redis_url: String,

    // Data layout
    /// Root of the shared data volume (task dirs, projects, model cache).
    pub data_root: PathBuf,
    /// Static deployment assets bundled into every archive.
    pub assets_dir: PathBuf,
    /// Launcher script invoked to run a fine-tuning job.
    pub training_launcher: PathBuf,
    /// Command run to pull base models from the hub.
    pub model_downloader: PathBuf,

    // Generation LLM
    /// OpenAI-compatible endpoint used for synthetic data generation.
    pub llm_base_url: String,
    /// Bearer token for the generation endpoint, if it requires one.
    pub llm_api_key: Option<String>,
    /// Model requested for generation.
    pub llm_model: String,
    /// Sampling temperature for generation.
    pub llm_temperature: f64,
    /// Completion budget per generation call.
    pub llm_max_tokens: u32,

    // Serving containers
    /// Image run for every serving container.
    pub serving_image: String,
    /// Image tag, normally the application release version.
    pub serving_image_tag: String,
    /// Container name prefix; the model id is appended.
    pub container_prefix: String,
    /// Docker network the serving containers join.
    pub docker_network: String,
    /// Named volume mounted into serving containers as the data root.
    pub docker_volume: String,
    /// Host group id granting access to the render device nodes.
    pub render_group_id: Option<String>,

    // Resource floors
    /// Free disk space required before a training job is dispatched (GB).
    pub training_storage_floor_gb: u64,
    /// RAM held back for a concurrent training job when serving starts (GB).
    pub training_reserve_gb: u64,
    /// RAM one serving container needs (GB).
    pub serving_memory_gb: u64,

    // Worker settings
    /// Workers per queue. One per queue keeps the accelerator exclusive.
    pub workers_per_queue: usize,
    /// Block time of one dequeue attempt.
    pub dequeue_timeout: Duration,
    /// How often the training runner polls for revocation.
    pub revocation_poll_interval: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            // Endpoint defaults
            api_url: "http://localhost:8000".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),

            // Layout defaults
            data_root: PathBuf::from("./data"),
            assets_dir: PathBuf::from("./assets/deployment"),
            training_launcher: PathBuf::from("./scripts/train.sh"),
            model_downloader: PathBuf::from("huggingface-cli"),

            // LLM defaults
            llm_base_url: "http://localhost:4000".to_string(),
            llm_api_key: None,
            llm_model: "mistral-7b-instruct".to_string(),
            llm_temperature: 0.7,
            llm_max_tokens: 2048,

            // Serving defaults
            serving_image: "tuneforge.serving".to_string(),
            serving_image_tag: "latest".to_string(),
            container_prefix: "tuneforge.serving-".to_string(),
            docker_network: "tuneforge-network".to_string(),
            docker_volume: "tuneforge-data-cache:/llm-data".to_string(),
            render_group_id: None,

            // Resource floor defaults
            training_storage_floor_gb: 60,
            training_reserve_gb: 50,
            serving_memory_gb: 6,

            // Worker defaults
            workers_per_queue: 1,
            dequeue_timeout: Duration::from_secs(5),
            revocation_poll_interval: Duration::from_secs(10),
        }
    }
}

impl AppConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TUNEFORGE_API_URL`: Record store base URL (required)
    /// - `TUNEFORGE_REDIS_URL`: Redis URL (default: redis://127.0.0.1:6379)
    /// - `TUNEFORGE_DATA_ROOT`: Shared data root (default: ./data)
    /// - `TUNEFORGE_ASSETS_DIR`: Deployment assets (default: ./assets/deployment)
    /// - `TUNEFORGE_TRAINING_LAUNCHER`: Training launcher (default: ./scripts/train.sh)
    /// - `TUNEFORGE_MODEL_DOWNLOADER`: Hub download command (default: huggingface-cli)
    /// - `TUNEFORGE_LLM_BASE_URL`: Generation endpoint (default: http://localhost:4000)
    /// - `TUNEFORGE_LLM_API_KEY`: Generation endpoint token (optional)
    /// - `TUNEFORGE_LLM_MODEL`: Generation model (default: mistral-7b-instruct)
    /// - `TUNEFORGE_LLM_TEMPERATURE`: Sampling temperature (default: 0.7)
    /// - `TUNEFORGE_LLM_MAX_TOKENS`: Completion budget (default: 2048)
    /// - `TUNEFORGE_SERVING_IMAGE`: Serving image (default: tuneforge.serving)
    /// - `TUNEFORGE_SERVING_IMAGE_TAG`: Image tag (default: latest)
    /// - `TUNEFORGE_CONTAINER_PREFIX`: Container name prefix (default: tuneforge.serving-)
    /// - `TUNEFORGE_DOCKER_NETWORK`: Container network (default: tuneforge-network)
    /// - `TUNEFORGE_DOCKER_VOLUME`: Data volume spec (default: tuneforge-data-cache:/llm-data)
    /// - `RENDER_GROUP_ID`: Host render group id (optional)
    /// - `TUNEFORGE_TRAINING_STORAGE_FLOOR_GB`: Disk floor for dispatch (default: 60)
    /// - `TUNEFORGE_TRAINING_RESERVE_GB`: RAM reserve for training (default: 50)
    /// - `TUNEFORGE_SERVING_MEMORY_GB`: RAM per serving container (default: 6)
    /// - `TUNEFORGE_WORKERS_PER_QUEUE`: Workers per queue (default: 1)
    /// - `TUNEFORGE_DEQUEUE_TIMEOUT_SECS`: Dequeue block time (default: 5)
    /// - `TUNEFORGE_REVOCATION_POLL_SECS`: Revocation poll interval (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or have invalid values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Endpoints - the record store URL is required
        config.api_url = std::env::var("TUNEFORGE_API_URL")
            .map_err(|_| ConfigError::MissingEnvVar("TUNEFORGE_API_URL".to_string()))?;

        if let Ok(val) = std::env::var("TUNEFORGE_REDIS_URL") {
            config.redis_url = val;
        }

        // Layout
        if let Ok(val) = std::env::var("TUNEFORGE_DATA_ROOT") {
            config.data_root = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("TUNEFORGE_ASSETS_DIR") {
            config.assets_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("TUNEFORGE_TRAINING_LAUNCHER") {
            config.training_launcher = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("TUNEFORGE_MODEL_DOWNLOADER") {
            config.model_downloader = PathBuf::from(val);
        }

        // LLM
        if let Ok(val) = std::env::var("TUNEFORGE_LLM_BASE_URL") {
            config.llm_base_url = val;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_LLM_API_KEY") {
            config.llm_api_key = Some(val);
        }

        if let Ok(val) = std::env::var("TUNEFORGE_LLM_MODEL") {
            config.llm_model = val;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_LLM_TEMPERATURE") {
            config.llm_temperature = parse_env_value(&val, "TUNEFORGE_LLM_TEMPERATURE")?;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_LLM_MAX_TOKENS") {
            config.llm_max_tokens = parse_env_value(&val, "TUNEFORGE_LLM_MAX_TOKENS")?;
        }

        // Serving
        if let Ok(val) = std::env::var("TUNEFORGE_SERVING_IMAGE") {
            config.serving_image = val;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_SERVING_IMAGE_TAG") {
            config.serving_image_tag = val;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_CONTAINER_PREFIX") {
            config.container_prefix = val;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_DOCKER_NETWORK") {
            config.docker_network = val;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_DOCKER_VOLUME") {
            config.docker_volume = val;
        }

        if let Ok(val) = std::env::var("RENDER_GROUP_ID") {
            config.render_group_id = Some(val);
        }

        // Resource floors
        if let Ok(val) = std::env::var("TUNEFORGE_TRAINING_STORAGE_FLOOR_GB") {
            config.training_storage_floor_gb =
                parse_env_value(&val, "TUNEFORGE_TRAINING_STORAGE_FLOOR_GB")?;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_TRAINING_RESERVE_GB") {
            config.training_reserve_gb = parse_env_value(&val, "TUNEFORGE_TRAINING_RESERVE_GB")?;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_SERVING_MEMORY_GB") {
            config.serving_memory_gb = parse_env_value(&val, "TUNEFORGE_SERVING_MEMORY_GB")?;
        }

        // Workers
        if let Ok(val) = std::env::var("TUNEFORGE_WORKERS_PER_QUEUE") {
            config.workers_per_queue = parse_env_value(&val, "TUNEFORGE_WORKERS_PER_QUEUE")?;
        }

        if let Ok(val) = std::env::var("TUNEFORGE_DEQUEUE_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "TUNEFORGE_DEQUEUE_TIMEOUT_SECS")?;
            config.dequeue_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TUNEFORGE_REVOCATION_POLL_SECS") {
            let secs: u64 = parse_env_value(&val, "TUNEFORGE_REVOCATION_POLL_SECS")?;
            config.revocation_poll_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Endpoint validation
        if self.api_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "api_url cannot be empty".to_string(),
            ));
        }

        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        // LLM validation
        if self.llm_model.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "llm_model cannot be empty".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return Err(ConfigError::ValidationFailed(
                "llm_temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.llm_max_tokens == 0 {
            return Err(ConfigError::ValidationFailed(
                "llm_max_tokens must be greater than 0".to_string(),
            ));
        }

        // Serving validation
        if self.serving_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "serving_image cannot be empty".to_string(),
            ));
        }

        if self.serving_image_tag.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "serving_image_tag cannot be empty".to_string(),
            ));
        }

        if self.container_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "container_prefix cannot be empty".to_string(),
            ));
        }

        // Resource floor validation
        if self.training_storage_floor_gb == 0 {
            return Err(ConfigError::ValidationFailed(
                "training_storage_floor_gb must be greater than 0".to_string(),
            ));
        }

        if self.serving_memory_gb == 0 {
            return Err(ConfigError::ValidationFailed(
                "serving_memory_gb must be greater than 0".to_string(),
            ));
        }

        // Worker validation
        if self.workers_per_queue == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers_per_queue must be greater than 0".to_string(),
            ));
        }

        if self.dequeue_timeout.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "dequeue_timeout must be at least one second".to_string(),
            ));
        }

        if self.revocation_poll_interval.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "revocation_poll_interval must be at least one second".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the record store URL.
    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the data root.
    pub fn with_data_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_root = path.into();
        self
    }

    /// Builder method to set the deployment assets directory.
    pub fn with_assets_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.assets_dir = path.into();
        self
    }

    /// Builder method to set the training launcher.
    pub fn with_training_launcher(mut self, path: impl Into<PathBuf>) -> Self {
        self.training_launcher = path.into();
        self
    }

    /// Builder method to set the hub download command.
    pub fn with_model_downloader(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_downloader = path.into();
        self
    }

    /// Builder method to set the generation endpoint.
    pub fn with_llm_base_url(mut self, url: impl Into<String>) -> Self {
        self.llm_base_url = url.into();
        self
    }

    /// Builder method to set the generation API key.
    pub fn with_llm_api_key(mut self, key: impl Into<String>) -> Self {
        self.llm_api_key = Some(key.into());
        self
    }

    /// Builder method to set the generation model.
    pub fn with_llm_model(mut self, model: impl Into<String>) -> Self {
        self.llm_model = model.into();
        self
    }

    /// Builder method to set the sampling temperature.
    pub fn with_llm_temperature(mut self, temp: f64) -> Self {
        self.llm_temperature = temp;
        self
    }

    /// Builder method to set the completion budget.
    pub fn with_llm_max_tokens(mut self, tokens: u32) -> Self {
        self.llm_max_tokens = tokens;
        self
    }

    /// Builder method to set the serving image.
    pub fn with_serving_image(mut self, image: impl Into<String>) -> Self {
        self.serving_image = image.into();
        self
    }

    /// Builder method to set the serving image tag.
    pub fn with_serving_image_tag(mut self, tag: impl Into<String>) -> Self {
        self.serving_image_tag = tag.into();
        self
    }

    /// Builder method to set the container name prefix.
    pub fn with_container_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.container_prefix = prefix.into();
        self
    }

    /// Builder method to set the container network.
    pub fn with_docker_network(mut self, network: impl Into<String>) -> Self {
        self.docker_network = network.into();
        self
    }

    /// Builder method to set the data volume spec.
    pub fn with_docker_volume(mut self, volume: impl Into<String>) -> Self {
        self.docker_volume = volume.into();
        self
    }

    /// Builder method to set the render group id.
    pub fn with_render_group_id(mut self, gid: impl Into<String>) -> Self {
        self.render_group_id = Some(gid.into());
        self
    }

    /// Builder method to set the dispatch storage floor.
    pub fn with_training_storage_floor_gb(mut self, gb: u64) -> Self {
        self.training_storage_floor_gb = gb;
        self
    }

    /// Builder method to set the training RAM reserve.
    pub fn with_training_reserve_gb(mut self, gb: u64) -> Self {
        self.training_reserve_gb = gb;
        self
    }

    /// Builder method to set the serving RAM floor.
    pub fn with_serving_memory_gb(mut self, gb: u64) -> Self {
        self.serving_memory_gb = gb;
        self
    }

    /// Builder method to set workers per queue.
    pub fn with_workers_per_queue(mut self, workers: usize) -> Self {
        self.workers_per_queue = workers;
        self
    }

    /// Builder method to set the dequeue block time.
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Builder method to set the revocation poll interval.
    pub fn with_revocation_poll_interval(mut self, interval: Duration) -> Self {
        self.revocation_poll_interval = interval;
        self
    }

    /// Full serving image reference, `image:tag`.
    pub fn serving_image_ref(&self) -> String {
        format!("{}:{}", self.serving_image, self.serving_image_tag)
    }

    /// Deterministic container name for a model.
    pub fn container_name(&self, model_id: crate::task::ModelId) -> String {
        format!("{}{}", self.container_prefix, model_id)
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.api_url, "http://localhost:8000");
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.data_root, PathBuf::from("./data"));
        assert_eq!(config.training_storage_floor_gb, 60);
        assert_eq!(config.training_reserve_gb, 50);
        assert_eq!(config.serving_memory_gb, 6);
        assert_eq!(config.workers_per_queue, 1);
        assert_eq!(config.dequeue_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_builder() {
        let config = AppConfig::new()
            .with_api_url("http://api:9000")
            .with_redis_url("redis://cache:6379")
            .with_data_root("/srv/data")
            .with_llm_model("llama-3-8b")
            .with_llm_temperature(0.2)
            .with_serving_image("acme.serving")
            .with_serving_image_tag("2.1.0")
            .with_workers_per_queue(2);

        assert_eq!(config.api_url, "http://api:9000");
        assert_eq!(config.redis_url, "redis://cache:6379");
        assert_eq!(config.data_root, PathBuf::from("/srv/data"));
        assert_eq!(config.llm_model, "llama-3-8b");
        assert!((config.llm_temperature - 0.2).abs() < f64::EPSILON);
        assert_eq!(config.serving_image_ref(), "acme.serving:2.1.0");
        assert_eq!(config.workers_per_queue, 2);
    }

    #[test]
    fn test_validation_valid_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_api_url() {
        let config = AppConfig::default().with_api_url("");
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("api_url"));
    }

    #[test]
    fn test_validation_empty_model() {
        let config = AppConfig::default().with_llm_model("");
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("llm_model"));
    }

    #[test]
    fn test_validation_invalid_temperature() {
        let config = AppConfig::default().with_llm_temperature(3.0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("llm_temperature"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let config = AppConfig::default().with_workers_per_queue(0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("workers_per_queue"));
    }

    #[test]
    fn test_validation_zero_storage_floor() {
        let config = AppConfig::default().with_training_storage_floor_gb(0);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("training_storage_floor_gb"));
    }

    #[test]
    fn test_container_name() {
        let config = AppConfig::default();
        assert_eq!(config.container_name(7), "tuneforge.serving-7");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::MissingEnvVar("TUNEFORGE_API_URL".to_string());
        assert!(err.to_string().contains("TUNEFORGE_API_URL"));

        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));
    }
}
