//! Task distribution gateway.
//!
//! Single point of truth for queue admission, enqueue, inspection and
//! mutation.  The admission check and the enqueue are deliberately not
//! atomic; concurrent submission can briefly overshoot the configured
//! maximum.  That soft bound is accepted rather than paying for a
//! distributed lock.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::Config;
use crate::queue::{
    ClaimedTask, EnqueueOptions, QueueEntry, QueueError, QueueSnapshot, QueueState, TaskQueue,
    QUEUE_CRITICAL,
};
use crate::task::PredictionPayload;

#[derive(Clone)]
pub struct TaskDistributor {
    queue: Arc<dyn TaskQueue>,
    max_queue_size: usize,
    task_timeout: std::time::Duration,
}

impl TaskDistributor {
    pub fn new(queue: Arc<dyn TaskQueue>, config: &Config) -> Self {
        Self {
            queue,
            max_queue_size: config.max_queue_size,
            task_timeout: config.task_timeout(),
        }
    }

    /// Advisory admission check: `true` while the backlog is below the
    /// configured maximum.
    pub fn admit(&self, backlog: usize) -> bool {
        backlog < self.max_queue_size
    }

    /// Current backlog of the critical queue.  An absent queue is size
    /// zero, not a failure.
    pub async fn queue_size(&self) -> Result<usize, QueueError> {
        match self.queue.snapshot(QUEUE_CRITICAL).await {
            Ok(snapshot) => Ok(snapshot.backlog()),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        self.queue.snapshot(QUEUE_CRITICAL).await
    }

    /// Enqueue a prediction task: one retry only (inference is expensive;
    /// recovery beyond that is the reconciliation engine's job), lease
    /// bounded by the configured task timeout.
    pub async fn enqueue_prediction(
        &self,
        payload: &PredictionPayload,
    ) -> Result<String, QueueError> {
        let raw =
            serde_json::to_string(payload).map_err(|e| QueueError::Decode(e.to_string()))?;
        let queue_id = self
            .queue
            .enqueue(
                QUEUE_CRITICAL,
                &raw,
                EnqueueOptions {
                    max_retry: 1,
                    timeout: self.task_timeout,
                },
            )
            .await?;
        info!(
            task_id = %payload.id,
            queue_id = %queue_id,
            queue = QUEUE_CRITICAL,
            "enqueued prediction task"
        );
        Ok(queue_id)
    }

    pub async fn claim(&self) -> Result<Option<ClaimedTask>, QueueError> {
        self.queue.claim(QUEUE_CRITICAL).await
    }

    pub async fn ack(&self, queue_id: &str) -> Result<(), QueueError> {
        self.queue.ack(QUEUE_CRITICAL, queue_id).await
    }

    pub async fn nack(&self, queue_id: &str) -> Result<(), QueueError> {
        self.queue.nack(QUEUE_CRITICAL, queue_id).await
    }

    /// Best-effort removal; tolerates entries that are already gone.
    pub async fn delete_task(&self, queue: &str, queue_id: &str) -> Result<(), QueueError> {
        self.queue.delete(queue, queue_id).await
    }

    pub async fn list(&self, state: QueueState) -> Result<Vec<QueueEntry>, QueueError> {
        self.queue.list(QUEUE_CRITICAL, state).await
    }

    /// Aggregate every not-yet-finished entry (scheduled, pending, retry,
    /// active).  A failing sub-list degrades to a partial view with a
    /// logged gap; it never aborts the aggregation.
    pub async fn list_unfinished(&self) -> Vec<QueueEntry> {
        let mut entries = Vec::new();
        for state in [
            QueueState::Scheduled,
            QueueState::Pending,
            QueueState::Retry,
            QueueState::Active,
        ] {
            match self.queue.list(QUEUE_CRITICAL, state).await {
                Ok(mut batch) => entries.append(&mut batch),
                Err(e) => error!(%state, error = %e, "failed to list queue entries"),
            }
        }
        entries
    }

    pub async fn pause(&self) -> Result<(), QueueError> {
        self.queue.pause(QUEUE_CRITICAL).await
    }

    pub async fn unpause(&self) -> Result<(), QueueError> {
        self.queue.unpause(QUEUE_CRITICAL).await
    }
}
