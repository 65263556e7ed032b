//! Redis-backed durable queue.
//!
//! Layout per queue `q` (namespace `mg`):
//! - `mg:q:scheduled|pending|active|retry|archived` — lists of entry ids,
//!   FIFO via LPUSH/RPOPLPUSH.
//! - `mg:q:t:{id}` — hash with the entry's payload and delivery metadata
//!   (`retried`, `max_retry`, `timeout_secs`, `due_at`, `last_failed_at`).
//! - `mg:q:paused` — presence stops claims.
//!
//! Every mutation is a small number of independent commands, not a
//! transaction; the worst case after a crash between commands is an entry
//! visible in no list, which the reconciliation engine resolves through
//! the record store.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use super::{
    ClaimedTask, EnqueueOptions, QueueEntry, QueueError, QueueSnapshot, QueueState, TaskQueue,
    RETRY_DELAY,
};
use crate::config::Config;

const NAMESPACE: &str = "mg";

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::Backend(e.to_string())
    }
}

pub struct RedisTaskQueue {
    manager: ConnectionManager,
    page_size: usize,
}

impl RedisTaskQueue {
    /// Connect to the Redis instance named in the configuration.
    pub async fn connect(config: &Config) -> Result<Self, QueueError> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            page_size: config.max_queue_size,
        })
    }

    fn list_key(queue: &str, state: QueueState) -> String {
        format!("{NAMESPACE}:{queue}:{state}")
    }

    fn entry_key(queue: &str, id: &str) -> String {
        format!("{NAMESPACE}:{queue}:t:{id}")
    }

    fn paused_key(queue: &str) -> String {
        format!("{NAMESPACE}:{queue}:paused")
    }

    async fn load_entry(
        &self,
        con: &mut ConnectionManager,
        queue: &str,
        id: &str,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let key = Self::entry_key(queue, id);
        let payload: Option<String> = con.hget(&key, "payload").await?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let retried: Option<u32> = con.hget(&key, "retried").await?;
        let max_retry: Option<u32> = con.hget(&key, "max_retry").await?;
        let last_failed_at: Option<String> = con.hget(&key, "last_failed_at").await?;
        Ok(Some(QueueEntry {
            id: id.to_owned(),
            queue: queue.to_owned(),
            payload,
            retried: retried.unwrap_or(0),
            max_retry: max_retry.unwrap_or(0),
            last_failed_at: last_failed_at
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|t| t.with_timezone(&Utc)),
        }))
    }

    /// Count one failed delivery attempt for `id`.
    async fn fail_attempt(
        &self,
        con: &mut ConnectionManager,
        queue: &str,
        id: &str,
    ) -> Result<(), QueueError> {
        let key = Self::entry_key(queue, id);
        for state in [QueueState::Pending, QueueState::Active, QueueState::Retry] {
            let _: () = con.lrem(Self::list_key(queue, state), 0, id).await?;
        }

        let retried: Option<u32> = con.hget(&key, "retried").await?;
        let max_retry: Option<u32> = con.hget(&key, "max_retry").await?;
        let (retried, max_retry) = (retried.unwrap_or(0), max_retry.unwrap_or(0));

        let now = Utc::now();
        let _: () = con
            .hset(&key, "last_failed_at", now.to_rfc3339())
            .await?;
        if retried < max_retry {
            let due = now.timestamp() + RETRY_DELAY.as_secs() as i64;
            let _: () = con.hset(&key, "retried", retried + 1).await?;
            let _: () = con.hset(&key, "due_at", due).await?;
            let _: () = con
                .lpush(Self::list_key(queue, QueueState::Retry), id)
                .await?;
            debug!(queue, id, retried = retried + 1, "queue entry scheduled for retry");
        } else {
            let _: () = con.hdel(&key, "due_at").await?;
            let _: () = con
                .lpush(Self::list_key(queue, QueueState::Archived), id)
                .await?;
            debug!(queue, id, "queue entry archived");
        }
        Ok(())
    }

    /// Move due retry entries back to pending and fail expired leases.
    async fn promote(&self, con: &mut ConnectionManager, queue: &str) -> Result<(), QueueError> {
        let now = Utc::now().timestamp();

        let retrying: Vec<String> = con
            .lrange(Self::list_key(queue, QueueState::Retry), 0, -1)
            .await?;
        for id in retrying {
            let due: Option<i64> = con.hget(Self::entry_key(queue, &id), "due_at").await?;
            if due.is_some_and(|t| t <= now) {
                let _: () = con.lrem(Self::list_key(queue, QueueState::Retry), 0, &id).await?;
                let _: () = con
                    .lpush(Self::list_key(queue, QueueState::Pending), &id)
                    .await?;
            }
        }

        let active: Vec<String> = con
            .lrange(Self::list_key(queue, QueueState::Active), 0, -1)
            .await?;
        for id in active {
            let due: Option<i64> = con.hget(Self::entry_key(queue, &id), "due_at").await?;
            if due.is_some_and(|t| t <= now) {
                debug!(queue, id, "active entry lease expired, re-delivering");
                self.fail_attempt(con, queue, &id).await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: &str,
        opts: EnqueueOptions,
    ) -> Result<String, QueueError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut con = self.manager.clone();
        let key = Self::entry_key(queue, &id);
        let _: () = con
            .hset_multiple(
                &key,
                &[
                    ("payload", payload.to_owned()),
                    ("retried", "0".to_owned()),
                    ("max_retry", opts.max_retry.to_string()),
                    ("timeout_secs", opts.timeout.as_secs().to_string()),
                ],
            )
            .await?;
        let _: () = con
            .lpush(Self::list_key(queue, QueueState::Pending), &id)
            .await?;
        Ok(id)
    }

    async fn claim(&self, queue: &str) -> Result<Option<ClaimedTask>, QueueError> {
        let mut con = self.manager.clone();
        let paused: bool = con.exists(Self::paused_key(queue)).await?;
        if paused {
            return Ok(None);
        }
        self.promote(&mut con, queue).await?;

        let id: Option<String> = con
            .rpoplpush(
                Self::list_key(queue, QueueState::Pending),
                Self::list_key(queue, QueueState::Active),
            )
            .await?;
        let Some(id) = id else {
            return Ok(None);
        };

        let key = Self::entry_key(queue, &id);
        let timeout_secs: Option<i64> = con.hget(&key, "timeout_secs").await?;
        let deadline = Utc::now().timestamp() + timeout_secs.unwrap_or(0);
        let _: () = con.hset(&key, "due_at", deadline).await?;

        let payload: Option<String> = con.hget(&key, "payload").await?;
        Ok(Some(ClaimedTask {
            id,
            queue: queue.to_owned(),
            payload: payload.unwrap_or_default(),
        }))
    }

    async fn ack(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut con = self.manager.clone();
        let _: () = con.lrem(Self::list_key(queue, QueueState::Active), 0, id).await?;
        let _: () = con.del(Self::entry_key(queue, id)).await?;
        Ok(())
    }

    async fn nack(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut con = self.manager.clone();
        self.fail_attempt(&mut con, queue, id).await
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        let mut con = self.manager.clone();
        for state in [
            QueueState::Scheduled,
            QueueState::Pending,
            QueueState::Active,
            QueueState::Retry,
            QueueState::Archived,
        ] {
            let _: () = con.lrem(Self::list_key(queue, state), 0, id).await?;
        }
        let _: () = con.del(Self::entry_key(queue, id)).await?;
        Ok(())
    }

    async fn snapshot(&self, queue: &str) -> Result<QueueSnapshot, QueueError> {
        let mut con = self.manager.clone();
        let mut counts = [0usize; 5];
        let states = [
            QueueState::Scheduled,
            QueueState::Pending,
            QueueState::Active,
            QueueState::Retry,
            QueueState::Archived,
        ];
        for (slot, state) in counts.iter_mut().zip(states) {
            *slot = con.llen(Self::list_key(queue, state)).await?;
        }
        Ok(QueueSnapshot {
            scheduled: counts[0],
            pending: counts[1],
            active: counts[2],
            retry: counts[3],
            archived: counts[4],
        })
    }

    async fn list(&self, queue: &str, state: QueueState) -> Result<Vec<QueueEntry>, QueueError> {
        let mut con = self.manager.clone();
        let ids: Vec<String> = con
            .lrange(
                Self::list_key(queue, state),
                0,
                self.page_size as isize - 1,
            )
            .await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entry) = self.load_entry(&mut con, queue, &id).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn pause(&self, queue: &str) -> Result<(), QueueError> {
        let mut con = self.manager.clone();
        let _: () = con.set(Self::paused_key(queue), 1).await?;
        Ok(())
    }

    async fn unpause(&self, queue: &str) -> Result<(), QueueError> {
        let mut con = self.manager.clone();
        let _: () = con.del(Self::paused_key(queue)).await?;
        Ok(())
    }
}
