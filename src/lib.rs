//! tuneforge: task orchestration and serving lifecycle for an LLM
//! fine-tuning platform.
//!
//! This library provides the worker side of the platform: Redis-backed job
//! queues, the task state machine and its record-store callbacks, synthetic
//! dataset generation, deployment packaging, model downloads and the Docker
//! serving lifecycle.

// Core modules
pub mod abort;
pub mod broker;
pub mod callback;
pub mod cli;
pub mod config;
pub mod generation;
pub mod hardware;
pub mod hub;
pub mod llm;
pub mod metrics;
pub mod packaging;
pub mod paths;
pub mod serving;
pub mod store;
pub mod task;
pub mod training;
pub mod worker;

// Re-export commonly used error types
pub use broker::QueueError;
pub use config::ConfigError;
pub use generation::GenerationError;
pub use hub::DownloadError;
pub use llm::LlmError;
pub use packaging::PackagingError;
pub use serving::{RuntimeError, ServingError};
pub use store::StoreError;
pub use training::TrainingError;
