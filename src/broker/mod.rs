//! Job broker: queue topology, job envelopes and the Redis transport.
//!
//! Each workload family has its own named queue and a worker pool bound to
//! exactly one queue. Producers publish typed payloads; the payload decides
//! its queue, so call sites never route by string.

mod job;
mod queue;

pub use job::{Job, JobHandle, JobPayload};
pub use queue::{JobBroker, QueueError, QueueStats};

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;

use crate::task::TaskStatus;

/// The fixed queue topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Fine-tuning jobs; serialized onto the shared accelerator.
    Training,
    /// Dataset generation over uploaded documents.
    Dataset,
    /// Dataset generation over embedded document chunks.
    Document,
    /// Model registry downloads.
    Common,
    /// Deployment archive builds.
    Deployment,
    /// Host inventory reporting.
    Telemetry,
}

impl QueueName {
    /// Every queue, in dispatch order.
    pub const ALL: [QueueName; 6] = [
        QueueName::Training,
        QueueName::Dataset,
        QueueName::Document,
        QueueName::Common,
        QueueName::Deployment,
        QueueName::Telemetry,
    ];

    /// Redis list name for this queue.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Training => "training_queue",
            QueueName::Dataset => "dataset_queue",
            QueueName::Document => "document_queue",
            QueueName::Common => "common_queue",
            QueueName::Deployment => "deployment_queue",
            QueueName::Telemetry => "telemetry_queue",
        }
    }

    /// Redis list holding this queue's in-flight jobs.
    pub fn processing_key(self) -> String {
        format!("{}:processing", self.as_str())
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim_end_matches("_queue") {
            "training" => Ok(QueueName::Training),
            "dataset" => Ok(QueueName::Dataset),
            "document" => Ok(QueueName::Document),
            "common" => Ok(QueueName::Common),
            "deployment" => Ok(QueueName::Deployment),
            "telemetry" => Ok(QueueName::Telemetry),
            other => Err(format!("unknown queue: {other}")),
        }
    }
}

/// Read-only broker view used by the crash-recovery scanner.
///
/// Split from [`JobBroker`] so recovery logic can be exercised against
/// scripted broker states in tests.
#[async_trait]
pub trait BrokerInspect: Send + Sync {
    /// Handles of jobs currently held by any worker, across all queues.
    async fn active_handles(&self) -> Result<Vec<JobHandle>, QueueError>;

    /// The broker's stored state for a job, if one was recorded.
    async fn job_state(&self, handle: &JobHandle) -> Result<Option<TaskStatus>, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names_match_topology() {
        assert_eq!(QueueName::Training.as_str(), "training_queue");
        assert_eq!(QueueName::Dataset.as_str(), "dataset_queue");
        assert_eq!(QueueName::Document.as_str(), "document_queue");
        assert_eq!(QueueName::Common.as_str(), "common_queue");
        assert_eq!(QueueName::Deployment.as_str(), "deployment_queue");
        assert_eq!(QueueName::Telemetry.as_str(), "telemetry_queue");
    }

    #[test]
    fn test_queue_parse_accepts_short_and_full_names() {
        assert_eq!("training".parse::<QueueName>().unwrap(), QueueName::Training);
        assert_eq!(
            "deployment_queue".parse::<QueueName>().unwrap(),
            QueueName::Deployment
        );
        assert!("gpu".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_processing_key_suffix() {
        assert_eq!(
            QueueName::Training.processing_key(),
            "training_queue:processing"
        );
    }
}
