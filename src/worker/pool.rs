//! Worker pool: one set of single-prefetch workers per queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{JobBroker, QueueName};
use crate::hardware;
use crate::metrics;

use super::executor::{JobExecutor, WorkerContext};
use super::recovery::recover_interrupted_training;

/// Pool of queue-bound workers.
///
/// Each worker holds at most one in-flight job; parallelism comes from the
/// worker count, not from prefetch. Shutdown is warm in the Celery sense:
/// workers drain the job they hold, however long it runs, then exit.
pub struct WorkerPool {
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Boots the pool.
    ///
    /// Boot order is fixed: the crash-recovery scan settles any training
    /// run that died while the node was down, the host inventory is pushed
    /// to the record store, and only then do workers start taking jobs.
    pub async fn start(context: WorkerContext) -> Self {
        recover_interrupted_training(&context.store, &context.broker).await;

        let inventory = hardware::collect_hardware_info();
        context.callbacks.hardware_info(&inventory).await;

        let executor = Arc::new(JobExecutor::new(context.clone()));
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut handles = Vec::new();
        for queue in QueueName::ALL {
            for slot in 0..context.config.workers_per_queue {
                let worker = Worker {
                    id: worker_name(queue, slot),
                    queue,
                    broker: context.broker.clone(),
                    executor: Arc::clone(&executor),
                    dequeue_timeout: context.config.dequeue_timeout,
                    shutdown_rx: shutdown_tx.subscribe(),
                };
                handles.push(tokio::spawn(worker.run()));
            }
        }

        info!(workers = handles.len(), "worker pool started");
        Self {
            shutdown_tx,
            handles,
        }
    }

    /// Number of workers the pool is running.
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Signals every worker and waits for all of them to drain.
    ///
    /// A worker blocked on an empty queue notices the signal after at most
    /// the dequeue timeout. A worker holding a job finishes it first; jobs
    /// are not time-bounded, so neither is this.
    pub async fn shutdown(mut self) {
        info!("draining worker pool");
        let _ = self.shutdown_tx.send(());
        for result in futures::future::join_all(self.handles.drain(..)).await {
            if let Err(error) = result {
                error!(error = %error, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}

fn worker_name(queue: QueueName, slot: usize) -> String {
    format!("{}-worker-{slot}", queue.as_str().trim_end_matches("_queue"))
}

/// One queue-bound worker loop.
struct Worker {
    id: String,
    queue: QueueName,
    broker: JobBroker,
    executor: Arc<JobExecutor>,
    dequeue_timeout: Duration,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    async fn run(mut self) {
        info!(worker_id = %self.id, queue = %self.queue, "worker started");
        metrics::worker_started();

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.broker.dequeue(self.queue, self.dequeue_timeout).await {
                Ok(Some(job)) => {
                    if self.skip_if_revoked(&job).await {
                        continue;
                    }
                    self.executor.execute(&job).await;
                }
                Ok(None) => {
                    debug!(worker_id = %self.id, queue = %self.queue, "queue empty");
                }
                Err(error) => {
                    error!(
                        worker_id = %self.id,
                        queue = %self.queue,
                        error = %error,
                        "dequeue failed"
                    );
                    tokio::time::sleep(self.dequeue_timeout).await;
                }
            }
        }

        metrics::worker_stopped();
        info!(worker_id = %self.id, "worker stopped");
    }

    /// Discards a job revoked while it sat in the queue.
    ///
    /// The revoke path already moved the task record and the job state to
    /// `REVOKED`; all that is left is to drop the envelope.
    async fn skip_if_revoked(&self, job: &crate::broker::Job) -> bool {
        match self.broker.is_revoked(&job.handle).await {
            Ok(true) => {
                info!(worker_id = %self.id, job_handle = %job.handle, "discarding revoked job");
                if let Err(error) = self.broker.acknowledge(job).await {
                    warn!(
                        worker_id = %self.id,
                        job_handle = %job.handle,
                        error = %error,
                        "could not acknowledge revoked job"
                    );
                }
                true
            }
            Ok(false) => false,
            Err(error) => {
                warn!(
                    worker_id = %self.id,
                    job_handle = %job.handle,
                    error = %error,
                    "revocation check failed, running the job"
                );
                false
            }
        }
    }
}
