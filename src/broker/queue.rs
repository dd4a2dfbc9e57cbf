//! Redis transport for the job broker.
//!
//! Layout per queue:
//!
//! - `{queue}`: published jobs (LPUSH, consumed from the right)
//! - `{queue}:processing`: jobs currently held by a worker
//!
//! Shared keys, TTL-bounded so crashed runs age out:
//!
//! - `jobs:state:{handle}`: last broker state recorded for the job
//! - `jobs:revoked:{handle}`: revocation flag checked by workers
//!
//! Dequeue uses BRPOPLPUSH so a job is never lost between the queue and a
//! worker; the processing list is also what answers "which handles are
//! active right now" for the crash-recovery scanner.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;

use super::{BrokerInspect, Job, JobHandle, JobPayload, QueueName};
use crate::task::TaskStatus;

/// Expiry for job state and revocation keys (7 days).
const JOB_KEY_TTL_SECS: u64 = 604_800;

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Redis-backed job broker shared by dispatchers and workers.
#[derive(Clone)]
pub struct JobBroker {
    /// Connection manager; clones share the underlying connection and
    /// reconnect automatically.
    redis: ConnectionManager,
}

impl JobBroker {
    /// Connects to Redis.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Self { redis })
    }

    /// Wraps an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Returns a clone of the underlying connection for components that
    /// share the broker's Redis (abort flags).
    pub fn connection(&self) -> ConnectionManager {
        self.redis.clone()
    }

    /// Publishes a payload to its queue and records the job as `PENDING`.
    /// Returns the minted handle.
    pub async fn publish(&self, payload: JobPayload) -> Result<JobHandle, QueueError> {
        let job = Job::new(payload);
        self.publish_job(&job).await?;
        Ok(job.handle)
    }

    /// Publishes a pre-built job envelope.
    pub async fn publish_job(&self, job: &Job) -> Result<(), QueueError> {
        let serialized = serde_json::to_string(job)?;
        let mut conn = self.redis.clone();
        self.set_job_state(&job.handle, TaskStatus::Pending).await?;
        conn.lpush::<_, _, ()>(job.payload.queue().as_str(), serialized)
            .await?;
        Ok(())
    }

    /// Blocks up to `timeout` for the next job on `queue`, atomically
    /// moving it onto the processing list.
    pub async fn dequeue(
        &self,
        queue: QueueName,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let mut conn = self.redis.clone();
        let timeout_secs = timeout.as_secs().max(1) as usize;

        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(queue.as_str())
            .arg(queue.processing_key())
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        match result {
            Some(data) => {
                let job: Job = serde_json::from_str(&data)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// Removes a finished job from its processing list.
    ///
    /// Absence is not an error; the entry may already be gone.
    pub async fn acknowledge(&self, job: &Job) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let processing = job.payload.queue().processing_key();
        let entries: Vec<String> = conn.lrange(&processing, 0, -1).await?;
        for entry in entries {
            if let Ok(held) = serde_json::from_str::<Job>(&entry) {
                if held.handle == job.handle {
                    conn.lrem::<_, _, ()>(&processing, 1, &entry).await?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Records the broker-side state for a job.
    pub async fn set_job_state(
        &self,
        handle: &JobHandle,
        state: TaskStatus,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(state_key(handle), state.as_str(), JOB_KEY_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Flags a job for revocation. Workers check the flag after dequeue and
    /// the training runner polls it while the subprocess runs.
    pub async fn revoke(&self, handle: &JobHandle) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(revoked_key(handle), "1", JOB_KEY_TTL_SECS)
            .await?;
        self.set_job_state(handle, TaskStatus::Revoked).await
    }

    /// Returns whether a job has been flagged for revocation.
    pub async fn is_revoked(&self, handle: &JobHandle) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(revoked_key(handle)).await?;
        Ok(exists)
    }

    /// Pending and in-flight depths for one queue.
    pub async fn queue_stats(&self, queue: QueueName) -> Result<QueueStats, QueueError> {
        let mut conn = self.redis.clone();
        let pending: usize = conn.llen(queue.as_str()).await?;
        let processing: usize = conn.llen(queue.processing_key()).await?;
        Ok(QueueStats {
            queue,
            pending,
            processing,
        })
    }

    /// Stats for every queue in the topology.
    pub async fn all_stats(&self) -> Result<Vec<QueueStats>, QueueError> {
        let mut stats = Vec::with_capacity(QueueName::ALL.len());
        for queue in QueueName::ALL {
            stats.push(self.queue_stats(queue).await?);
        }
        Ok(stats)
    }

    /// Deletes a queue's main and processing lists. Test and operator use
    /// only; in-flight jobs are dropped.
    pub async fn purge(&self, queue: QueueName) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.del(queue.as_str()).del(queue.processing_key());
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl BrokerInspect for JobBroker {
    async fn active_handles(&self) -> Result<Vec<JobHandle>, QueueError> {
        let mut conn = self.redis.clone();
        let mut handles = Vec::new();
        for queue in QueueName::ALL {
            let entries: Vec<String> = conn.lrange(queue.processing_key(), 0, -1).await?;
            for entry in entries {
                if let Ok(job) = serde_json::from_str::<Job>(&entry) {
                    handles.push(job.handle);
                }
            }
        }
        Ok(handles)
    }

    async fn job_state(&self, handle: &JobHandle) -> Result<Option<TaskStatus>, QueueError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(state_key(handle)).await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }
}

fn state_key(handle: &JobHandle) -> String {
    format!("jobs:state:{handle}")
}

fn revoked_key(handle: &JobHandle) -> String {
    format!("jobs:revoked:{handle}")
}

/// Depths of one queue.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub queue: QueueName,
    /// Jobs waiting to be picked up.
    pub pending: usize,
    /// Jobs currently held by workers.
    pub processing: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing
    }
}
