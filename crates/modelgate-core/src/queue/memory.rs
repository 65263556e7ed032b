//! In-memory queue implementation.
//!
//! Semantically equivalent to [`super::RedisTaskQueue`] for a single
//! process: per-state FIFO order, lease deadlines, retry promotion and
//! archiving.  Used by tests and available for local single-process
//! deployments, where it also satisfies the shutdown drain's "private
//! queue" requirement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    ClaimedTask, EnqueueOptions, QueueEntry, QueueError, QueueSnapshot, QueueState, TaskQueue,
    RETRY_DELAY,
};

struct Entry {
    payload: String,
    retried: u32,
    max_retry: u32,
    timeout: std::time::Duration,
    last_failed_at: Option<DateTime<Utc>>,
    /// Lease deadline while active, retry-due time while in retry.
    due_at: Option<Instant>,
}

#[derive(Default)]
struct QueueInner {
    /// FIFO per state: push back, pop front.
    states: HashMap<QueueState, VecDeque<String>>,
    entries: HashMap<String, Entry>,
    paused: bool,
}

impl QueueInner {
    fn bucket(&mut self, state: QueueState) -> &mut VecDeque<String> {
        self.states.entry(state).or_default()
    }

    fn remove_everywhere(&mut self, id: &str) {
        for bucket in self.states.values_mut() {
            bucket.retain(|entry| entry != id);
        }
    }

    fn state_of(&self, id: &str) -> Option<QueueState> {
        self.states
            .iter()
            .find(|(_, bucket)| bucket.iter().any(|entry| entry == id))
            .map(|(state, _)| *state)
    }

    fn due_in(&self, state: QueueState, now: Instant) -> Vec<String> {
        self.states
            .get(&state)
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|id| {
                        self.entries
                            .get(*id)
                            .and_then(|e| e.due_at)
                            .is_some_and(|t| t <= now)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Move due retry entries back to pending and fail expired leases.
    fn promote(&mut self, now: Instant) {
        for id in self.due_in(QueueState::Retry, now) {
            self.bucket(QueueState::Retry).retain(|e| e != &id);
            self.bucket(QueueState::Pending).push_back(id);
        }
        for id in self.due_in(QueueState::Active, now) {
            self.fail_attempt(&id, now);
        }
    }

    /// Count one failed delivery attempt: retry while budget remains,
    /// archive once exhausted.
    fn fail_attempt(&mut self, id: &str, now: Instant) {
        self.remove_everywhere(id);
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        if entry.retried < entry.max_retry {
            entry.retried += 1;
            entry.last_failed_at = Some(Utc::now());
            entry.due_at = Some(now + RETRY_DELAY);
            self.bucket(QueueState::Retry).push_back(id.to_owned());
        } else {
            entry.last_failed_at = Some(Utc::now());
            entry.due_at = None;
            self.bucket(QueueState::Archived).push_back(id.to_owned());
        }
    }
}

#[derive(Default)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, QueueInner>>,
    fail_deletes: AtomicBool,
    page_size: usize,
}

impl InMemoryQueue {
    pub fn new(page_size: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            fail_deletes: AtomicBool::new(false),
            page_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, QueueInner>> {
        self.queues.lock().expect("queue mutex poisoned")
    }

    /// Make every subsequent `delete` fail, as if the backing store were
    /// unreachable.  Test hook.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Insert an entry directly into a state bucket.  Test hook for states
    /// normal enqueue cannot produce (archived, scheduled).
    pub fn push_state(
        &self,
        queue: &str,
        state: QueueState,
        payload: &str,
        last_failed_at: Option<DateTime<Utc>>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let mut queues = self.lock();
        let inner = queues.entry(queue.to_owned()).or_default();
        inner.entries.insert(
            id.clone(),
            Entry {
                payload: payload.to_owned(),
                retried: 0,
                max_retry: 0,
                timeout: std::time::Duration::from_secs(0),
                last_failed_at,
                due_at: None,
            },
        );
        inner.bucket(state).push_back(id.clone());
        id
    }

    /// The state bucket currently holding `id`, if any.  Test hook.
    pub fn state_of(&self, queue: &str, id: &str) -> Option<QueueState> {
        self.lock().get(queue).and_then(|inner| inner.state_of(id))
    }
}

#[async_trait::async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: &str,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let id = Uuid::new_v4().to_string();
        let mut queues = self.lock();
        let inner = queues.entry(queue.to_owned()).or_default();
        inner.entries.insert(
            id.clone(),
            Entry {
                payload: payload.to_owned(),
                retried: 0,
                max_retry: opts.max_retry,
                timeout: opts.timeout,
                last_failed_at: None,
                due_at: None,
            },
        );
        inner.bucket(QueueState::Pending).push_back(id.clone());
        Ok(id)
    }

    async fn claim(&self, queue: &str) -> Result<Option<ClaimedTask>, QueueError> {
        let now = Instant::now();
        let mut queues = self.lock();
        let Some(inner) = queues.get_mut(queue) else {
            return Ok(None);
        };
        if inner.paused {
            return Ok(None);
        }
        inner.promote(now);
        let Some(id) = inner.bucket(QueueState::Pending).pop_front() else {
            return Ok(None);
        };
        let timeout = inner
            .entries
            .get(&id)
            .map(|e| e.timeout)
            .unwrap_or_default();
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.due_at = Some(now + timeout);
        }
        inner.bucket(QueueState::Active).push_back(id.clone());
        let payload = inner
            .entries
            .get(&id)
            .map(|e| e.payload.clone())
            .unwrap_or_default();
        Ok(Some(ClaimedTask {
            id,
            queue: queue.to_owned(),
            payload,
        }))
    }

    async fn ack(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut queues = self.lock();
        if let Some(inner) = queues.get_mut(queue) {
            inner.remove_everywhere(id);
            inner.entries.remove(id);
        }
        Ok(())
    }

    async fn nack(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut queues = self.lock();
        if let Some(inner) = queues.get_mut(queue) {
            inner.fail_attempt(id, now);
        }
        Ok(())
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(QueueError::Backend("queue unreachable".to_owned()));
        }
        let mut queues = self.lock();
        if let Some(inner) = queues.get_mut(queue) {
            inner.remove_everywhere(id);
            inner.entries.remove(id);
        }
        Ok(())
    }

    async fn snapshot(&self, queue: &str) -> Result<QueueSnapshot, QueueError> {
        let queues = self.lock();
        let inner = queues
            .get(queue)
            .ok_or_else(|| QueueError::QueueNotFound(queue.to_owned()))?;
        let count =
            |state: QueueState| inner.states.get(&state).map(VecDeque::len).unwrap_or(0);
        Ok(QueueSnapshot {
            scheduled: count(QueueState::Scheduled),
            pending: count(QueueState::Pending),
            active: count(QueueState::Active),
            retry: count(QueueState::Retry),
            archived: count(QueueState::Archived),
        })
    }

    async fn list(&self, queue: &str, state: QueueState) -> Result<Vec<QueueEntry>, QueueError> {
        let queues = self.lock();
        let Some(inner) = queues.get(queue) else {
            return Ok(Vec::new());
        };
        let Some(bucket) = inner.states.get(&state) else {
            return Ok(Vec::new());
        };
        Ok(bucket
            .iter()
            .take(self.page_size)
            .filter_map(|id| {
                inner.entries.get(id).map(|entry| QueueEntry {
                    id: id.clone(),
                    queue: queue.to_owned(),
                    payload: entry.payload.clone(),
                    retried: entry.retried,
                    max_retry: entry.max_retry,
                    last_failed_at: entry.last_failed_at,
                })
            })
            .collect())
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        self.lock().entry(queue.to_owned()).or_default().paused = true;
        Ok(())
    }

    async fn unpause(&self, queue: &str) -> Result<(), QueueError> {
        self.lock().entry(queue.to_owned()).or_default().paused = false;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn opts() -> EnqueueOptions {
        EnqueueOptions {
            max_retry: 1,
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn claim_moves_entry_from_pending_to_active() {
        let queue = InMemoryQueue::new(32);
        let id = queue.enqueue("critical", "{}", opts()).await.unwrap();

        let claimed = queue.claim("critical").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);

        let snap = queue.snapshot("critical").await.unwrap();
        assert_eq!(snap.pending, 0);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.backlog(), 0);
    }

    #[tokio::test]
    async fn nack_retries_then_archives() {
        let queue = InMemoryQueue::new(32);
        let id = queue.enqueue("critical", "{}", opts()).await.unwrap();

        queue.claim("critical").await.unwrap().unwrap();
        queue.nack("critical", &id).await.unwrap();
        assert_eq!(queue.state_of("critical", &id), Some(QueueState::Retry));

        // Second failed attempt exhausts max_retry = 1.
        queue.nack("critical", &id).await.unwrap();
        assert_eq!(queue.state_of("critical", &id), Some(QueueState::Archived));
        let entry = &queue.list("critical", QueueState::Archived).await.unwrap()[0];
        assert!(entry.last_failed_at.is_some());
    }

    #[tokio::test]
    async fn paused_queue_stops_claims_but_keeps_entries() {
        let queue = InMemoryQueue::new(32);
        queue.enqueue("critical", "{}", opts()).await.unwrap();

        queue.pause("critical").await.unwrap();
        assert!(queue.claim("critical").await.unwrap().is_none());
        assert_eq!(queue.snapshot("critical").await.unwrap().pending, 1);

        queue.unpause("critical").await.unwrap();
        assert!(queue.claim("critical").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_of_missing_entry_is_idempotent() {
        let queue = InMemoryQueue::new(32);
        queue.enqueue("critical", "{}", opts()).await.unwrap();
        assert!(queue.delete("critical", "no-such-id").await.is_ok());
    }

    #[tokio::test]
    async fn snapshot_of_unknown_queue_is_reported_distinctly() {
        let queue = InMemoryQueue::new(32);
        let err = queue.snapshot("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_is_bounded_by_page_size() {
        let queue = InMemoryQueue::new(2);
        for _ in 0..5 {
            queue.enqueue("critical", "{}", opts()).await.unwrap();
        }
        let entries = queue.list("critical", QueueState::Pending).await.unwrap();
        assert_eq!(entries.len(), 2);
    }
}
