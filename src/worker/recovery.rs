//! Crash-recovery scan for training runs that died between worker sessions.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::broker::{BrokerInspect, JobHandle};
use crate::store::RecordStore;
use crate::task::{TaskPatch, TaskStatus};

/// Operator-facing failure text for a training run that vanished without
/// reporting back. The dominant cause in the field is the OOM reaper, so
/// the message points there first.
pub(crate) const INTERRUPTED_TRAINING_MESSAGE: &str = "Training Error. Error: Training process failure due to OOM(out of memory). Please verify if you have sufficient CPU RAM or GPU RAM before training.";

/// Fails over a training task whose process died while this node was down.
///
/// Reads the accelerator marker and cross-checks it against the broker: a
/// claimed handle that is neither held by any worker nor settled in a
/// terminal state means the process died mid-run, and the task record is
/// forced to `FAILURE` through the normal merge-update path. The marker
/// itself is left in place; the next training run overwrites it.
///
/// Every store and broker error is logged and swallowed. This runs during
/// worker boot, and a worker must come up even when the record store or
/// the broker is briefly unreachable.
pub async fn recover_interrupted_training(
    store: &Arc<dyn RecordStore>,
    broker: &dyn BrokerInspect,
) {
    let marker = match store.running_task().await {
        Ok(marker) => marker,
        Err(error) => {
            warn!(error = %error, "recovery scan skipped, running-task marker unreadable");
            return;
        }
    };

    let (Some(task_id), Some(raw_handle)) = (marker.task_id, marker.job_handle) else {
        info!("recovery scan: no training run claimed the accelerator");
        return;
    };
    if raw_handle.is_empty() {
        info!("recovery scan: no training run claimed the accelerator");
        return;
    }
    let handle = JobHandle::from(raw_handle);

    match broker.active_handles().await {
        Ok(active) if active.contains(&handle) => {
            info!(task_id, job_handle = %handle, "recovery scan: training job is still in flight");
            return;
        }
        Ok(_) => {}
        Err(error) => {
            warn!(error = %error, "recovery scan skipped, could not list in-flight jobs");
            return;
        }
    }

    match broker.job_state(&handle).await {
        Ok(Some(state)) if state.is_terminal() => {
            info!(
                task_id,
                job_handle = %handle,
                state = state.as_str(),
                "recovery scan: training job already settled"
            );
            return;
        }
        Ok(_) => {}
        Err(error) => {
            warn!(error = %error, "recovery scan skipped, could not read job state");
            return;
        }
    }

    warn!(
        task_id,
        job_handle = %handle,
        "recovery scan: training run died mid-flight, failing the task"
    );
    let patch = TaskPatch::status(TaskStatus::Failure)
        .with_result("status", json!(INTERRUPTED_TRAINING_MESSAGE));
    if let Err(error) = store.update_task(task_id, &patch).await {
        warn!(task_id, error = %error, "recovery scan could not fail the interrupted task");
    }
}
