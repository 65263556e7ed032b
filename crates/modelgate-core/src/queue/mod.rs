//! Durable work-queue capability.
//!
//! The queue is an ephemeral dispatch mechanism, never a source of truth
//! for final task status.  A queue entry moves through five states:
//!
//! `scheduled` → `pending` → `active` → (done) | `retry` → `pending` | `archived`
//!
//! An entry is archived once its delivery attempts are exhausted; the
//! reconciliation engine is responsible for folding archived entries back
//! into the record store.  Implementations must be safe for concurrent use
//! by many processor workers.

mod memory;
mod redis;

pub use memory::InMemoryQueue;
pub use redis::RedisTaskQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// The state buckets a queue entry can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum QueueState {
    Scheduled,
    Pending,
    Active,
    Retry,
    Archived,
}

/// Point-in-time entry counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub scheduled: usize,
    pub pending: usize,
    pub active: usize,
    pub retry: usize,
    pub archived: usize,
}

impl QueueSnapshot {
    /// The admission-control signal: entries waiting for a worker.  Active
    /// entries are already running and do not count against queue pressure.
    pub fn backlog(&self) -> usize {
        self.scheduled + self.pending + self.retry
    }
}

/// Delivery options set at enqueue time.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOptions {
    /// Failed delivery attempts allowed before the entry is archived.
    pub max_retry: u32,
    /// Lease duration for a claimed entry; an active entry past this
    /// deadline is treated as lost and re-delivered.
    pub timeout: Duration,
}

/// A queue entry as returned by list operations.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// The queue's own identifier, distinct from the task's `id`.
    pub id: String,
    pub queue: String,
    /// Serialized [`crate::task::PredictionPayload`].
    pub payload: String,
    pub retried: u32,
    pub max_retry: u32,
    /// Set when the entry last failed delivery (retry and archived states).
    pub last_failed_at: Option<DateTime<Utc>>,
}

/// An entry leased to a processor worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: String,
    pub queue: String,
    pub payload: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// The named queue does not exist.  Reported distinctly so callers can
    /// treat an absent queue as size zero rather than an operational
    /// failure.
    #[error("queue {0} not found")]
    QueueNotFound(String),

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("failed to decode queue entry: {0}")]
    Decode(String),
}

impl QueueError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::QueueNotFound(_))
    }
}

/// Capability over the durable work queue.
///
/// `delete` is idempotent: removing an entry that is already gone satisfies
/// the caller's intent and is not an error.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Submit a payload; returns the queue's identifier for the new entry.
    async fn enqueue(
        &self,
        queue: &str,
        payload: &str,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError>;

    /// Lease the next pending entry, or `None` when the queue is empty or
    /// paused.  Also promotes due retry entries and re-delivers active
    /// entries whose lease expired.
    async fn claim(&self, queue: &str) -> Result<Option<ClaimedTask>, QueueError>;

    /// Retire a claimed entry after terminal processing.
    async fn ack(&self, queue: &str, id: &str) -> Result<(), QueueError>;

    /// Return a claimed entry for redelivery; archives it once its retry
    /// budget is exhausted.
    async fn nack(&self, queue: &str, id: &str) -> Result<(), QueueError>;

    /// Best-effort removal from any state.
    async fn delete(&self, queue: &str, id: &str) -> Result<(), QueueError>;

    async fn snapshot(&self, queue: &str) -> Result<QueueSnapshot, QueueError>;

    /// Read-only enumeration of one state bucket, bounded by the configured
    /// page size.
    async fn list(&self, queue: &str, state: QueueState) -> Result<Vec<QueueEntry>, QueueError>;

    /// Stop workers from claiming new entries without dropping queued ones.
    async fn pause(&self, queue: &str) -> Result<(), QueueError>;

    async fn unpause(&self, queue: &str) -> Result<(), QueueError>;
}

/// Name of the single FIFO queue all prediction tasks go through.
pub const QUEUE_CRITICAL: &str = "critical";

/// Fixed delay before a nacked entry becomes claimable again.
pub(crate) const RETRY_DELAY: Duration = Duration::from_secs(5);
