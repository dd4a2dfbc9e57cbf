//! Cooperative abort for long-running generation jobs.
//!
//! Abort is a request, not a kill: a flag keyed by job handle is set in
//! Redis and the running job polls it at its own checkpoints. That keeps
//! partially produced data consistent; the job decides where it is safe
//! to stop.
//!
//! Distinct from revocation: revoked jobs are terminated (training) or
//! dropped before execution, while aborted jobs finish on their own terms
//! and report an aborted outcome rather than an error.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::broker::{JobHandle, QueueError};

/// Expiry for abort flags (7 days), matching the broker's job keys.
const ABORT_KEY_TTL_SECS: u64 = 604_800;

/// Polled by jobs at checkpoints to learn whether an abort was requested.
///
/// Implementations must be cheap to call repeatedly and must never fail
/// the job: transport errors read as "not aborted".
#[async_trait]
pub trait AbortSignal: Send + Sync {
    async fn is_aborted(&self) -> bool;
}

/// Sets and inspects abort flags in Redis.
#[derive(Clone)]
pub struct AbortController {
    redis: ConnectionManager,
}

impl AbortController {
    pub fn new(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    /// Requests that the job holding `handle` stop at its next checkpoint.
    pub async fn request_abort(&self, handle: &JobHandle) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.set_ex::<_, _, ()>(abort_key(handle), "1", ABORT_KEY_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Returns whether an abort has been requested for `handle`.
    pub async fn is_aborted(&self, handle: &JobHandle) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let exists: bool = conn.exists(abort_key(handle)).await?;
        Ok(exists)
    }

    /// Binds a handle into a signal the job can poll without carrying the
    /// controller around.
    pub fn token(&self, handle: &JobHandle) -> AbortToken {
        AbortToken {
            redis: self.redis.clone(),
            key: abort_key(handle),
        }
    }
}

/// [`AbortSignal`] bound to one job's flag.
#[derive(Clone)]
pub struct AbortToken {
    redis: ConnectionManager,
    key: String,
}

#[async_trait]
impl AbortSignal for AbortToken {
    async fn is_aborted(&self) -> bool {
        let mut conn = self.redis.clone();
        match conn.exists::<_, bool>(&self.key).await {
            Ok(flag) => flag,
            Err(error) => {
                warn!(key = %self.key, error = %error, "abort flag check failed, continuing");
                false
            }
        }
    }
}

/// In-process abort switch for tests and local runs.
#[derive(Clone, Default)]
pub struct ManualAbort {
    flag: Arc<AtomicBool>,
}

impl ManualAbort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips the switch; every subsequent poll reads aborted.
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AbortSignal for ManualAbort {
    async fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

fn abort_key(handle: &JobHandle) -> String {
    format!("jobs:abort:{handle}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_key_layout() {
        let handle = JobHandle::from("gen-42");
        assert_eq!(abort_key(&handle), "jobs:abort:gen-42");
    }

    #[tokio::test]
    async fn test_manual_abort_starts_clear() {
        let signal = ManualAbort::new();
        assert!(!signal.is_aborted().await);
    }

    #[tokio::test]
    async fn test_manual_abort_latches() {
        let signal = ManualAbort::new();
        signal.trigger();
        assert!(signal.is_aborted().await);
        assert!(signal.is_aborted().await);
    }
}
