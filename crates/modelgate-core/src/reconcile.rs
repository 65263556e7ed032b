//! Reconciliation engine.
//!
//! The queue and the record store can disagree: entries get archived after
//! exhausted retries, workers die mid-task, record keys expire.  The sweeps
//! here fold every such divergence back into the record store, which is the
//! view callers trust.  Each sweep is idempotent and safe to run alongside
//! live traffic.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::distributor::TaskDistributor;
use crate::metrics::MetricsSink;
use crate::queue::QueueState;
use crate::record::RecordStore;
use crate::task::{PredictionPayload, TaskStatus, TaskUpdate};

/// How long a failed record write keeps an archived entry around for
/// another attempt before the entry is dropped regardless.
const ARCHIVED_GRACE_HOURS: i64 = 12;

/// Interval between periodic reconciliation rounds.
pub const CHECK_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub struct ReconcileEngine {
    distributor: TaskDistributor,
    store: Arc<dyn RecordStore>,
    metrics: Arc<dyn MetricsSink>,
    model_name: String,
    task_timeout: Duration,
    queue_private: bool,
}

impl ReconcileEngine {
    pub fn new(
        distributor: TaskDistributor,
        store: Arc<dyn RecordStore>,
        metrics: Arc<dyn MetricsSink>,
        config: &Config,
    ) -> Self {
        Self {
            distributor,
            store,
            metrics,
            model_name: config.model_name.clone(),
            task_timeout: config.task_timeout(),
            queue_private: config.queue_private,
        }
    }

    /// Fold archived queue entries back into the record store.
    ///
    /// Each archived entry marks its task `failed`.  A failed record write
    /// leaves the entry in place while `last_failed_at` is inside the grace
    /// window; past the window the entry is dropped either way.  Returns the
    /// number of entries removed.
    pub async fn check_archived_tasks(&self) -> usize {
        let entries = match self.distributor.list(QueueState::Archived).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return 0,
            Err(e) => {
                error!(error = %e, "failed to list archived tasks");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries {
            match serde_json::from_str::<PredictionPayload>(&entry.payload) {
                Ok(payload) => {
                    // A record that already reached a terminal status must
                    // not be overwritten by the sweep.
                    if let Ok(info) = self.store.get_task_typed(&payload.id).await {
                        if info.status.is_terminal() {
                            if let Err(e) =
                                self.distributor.delete_task(&entry.queue, &entry.id).await
                            {
                                error!(queue_id = %entry.id, error = %e, "failed to delete archived entry");
                                continue;
                            }
                            removed += 1;
                            continue;
                        }
                    }
                    let update = TaskUpdate::new(&payload.id)
                        .status(TaskStatus::Failed)
                        .error_info("failed due to system errors");
                    if let Err(e) = self.store.update_task(&update).await {
                        let in_grace = entry
                            .last_failed_at
                            .is_some_and(|at| {
                                chrono::Utc::now() - at < chrono::Duration::hours(ARCHIVED_GRACE_HOURS)
                            });
                        if in_grace {
                            warn!(
                                task_id = %payload.id,
                                error = %e,
                                "failed to mark archived task, keeping entry for another round"
                            );
                            continue;
                        }
                        error!(
                            task_id = %payload.id,
                            error = %e,
                            "archived task record unreachable past grace window, dropping entry"
                        );
                    } else {
                        info!(task_id = %payload.id, "archived task marked failed");
                    }
                }
                Err(e) => {
                    warn!(queue_id = %entry.id, error = %e, "undecodable archived entry, dropping");
                }
            }
            if let Err(e) = self.distributor.delete_task(&entry.queue, &entry.id).await {
                error!(queue_id = %entry.id, error = %e, "failed to delete archived entry");
                continue;
            }
            removed += 1;
        }
        removed
    }

    /// Force records stuck in `pending`/`running` to `failed` once their
    /// queue entry has vanished.
    ///
    /// Candidates are sampled, then given one full `task_timeout` to make
    /// progress before the queue is re-examined; only a record whose status
    /// has not moved and whose queue_id is absent from the unfinished set is
    /// forced.  Returns the forced count.
    pub async fn check_task_status(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        if self.model_name.is_empty() {
            warn!("model name not configured, skipping stale-status sweep");
            return 0;
        }

        let mut candidates = Vec::new();
        for status in [TaskStatus::Pending, TaskStatus::Running] {
            match self
                .store
                .list_ids_by_model_status(&self.model_name, status)
                .await
            {
                Ok(ids) => candidates.extend(ids.into_iter().map(|id| (id, status))),
                Err(e) => warn!(%status, error = %e, "failed to list task records"),
            }
        }
        if candidates.is_empty() {
            self.metrics.set_tasks_forced_failed(0);
            return 0;
        }

        // Give in-flight work a full timeout to finish before judging.
        let wait = tokio::time::sleep(self.task_timeout);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                _ = &mut wait => break,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return 0;
                    }
                }
            }
        }

        let unfinished: HashSet<String> = self
            .distributor
            .list_unfinished()
            .await
            .into_iter()
            .map(|entry| entry.id)
            .collect();

        let mut forced = 0;
        for (id, observed) in candidates {
            match self.store.get_task_typed(&id).await {
                Ok(info) => {
                    if info.status != observed {
                        continue;
                    }
                    if !info.queue_id.is_empty() && unfinished.contains(&info.queue_id) {
                        continue;
                    }
                    let update = TaskUpdate::new(&id)
                        .status(TaskStatus::Failed)
                        .error_info("Unknown failure");
                    if let Err(e) = self.store.update_task(&update).await {
                        error!(task_id = %id, error = %e, "failed to force stale task to failed");
                        continue;
                    }
                    warn!(task_id = %id, status = %observed, "stale task forced to failed");
                    forced += 1;
                }
                Err(e) => {
                    // Record key expired mid-flight; rewrite it terminal
                    // without touching the queue.
                    warn!(task_id = %id, error = %e, "task record unreadable, forcing failed");
                    let update = TaskUpdate::new(&id)
                        .status(TaskStatus::Failed)
                        .error_info("Unknown failure")
                        .database_only();
                    if let Err(e) = self.store.update_task(&update).await {
                        error!(task_id = %id, error = %e, "failed to rewrite expired task record");
                    }
                    forced += 1;
                }
            }
        }
        self.metrics.set_tasks_forced_failed(forced);
        forced
    }

    /// Fail every waiting entry on the way out.  Only meaningful when this
    /// process owns the queue exclusively; with a shared queue another
    /// replica will pick the entries up instead.
    pub async fn shutdown_drain(&self) -> usize {
        if !self.queue_private {
            info!("queue is shared, leaving entries for other replicas");
            return 0;
        }

        let mut drained = 0;
        for state in [QueueState::Scheduled, QueueState::Pending, QueueState::Retry] {
            let entries = match self.distributor.list(state).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    error!(%state, error = %e, "failed to list entries for drain");
                    continue;
                }
            };
            for entry in entries {
                if let Ok(payload) = serde_json::from_str::<PredictionPayload>(&entry.payload) {
                    let update = TaskUpdate::new(&payload.id)
                        .status(TaskStatus::Failed)
                        .error_info("the task queue was closed");
                    if let Err(e) = self.store.update_task(&update).await {
                        error!(task_id = %payload.id, error = %e, "failed to mark drained task");
                    }
                }
                if let Err(e) = self.distributor.delete_task(&entry.queue, &entry.id).await {
                    error!(queue_id = %entry.id, error = %e, "failed to delete drained entry");
                    continue;
                }
                drained += 1;
            }
        }
        info!(drained, "queue drained on shutdown");
        drained
    }

    /// Run both sweeps immediately, then on a fixed interval until shutdown.
    /// The first round runs before any sleep so tasks orphaned by a prior
    /// crash are reconciled right after boot.
    pub async fn periodic_check(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let removed = self.check_archived_tasks().await;
            let forced = self.check_task_status(shutdown.clone()).await;
            info!(removed, forced, "periodic reconciliation round finished");
            tokio::select! {
                _ = tokio::time::sleep(CHECK_INTERVAL) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metrics::RecordingSink;
    use crate::queue::{InMemoryQueue, TaskQueue, QUEUE_CRITICAL};
    use crate::record::MemoryRecordStore;
    use crate::task::InferRequest;
    use serde_json::Map;
    use std::sync::atomic::Ordering;

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        store: Arc<MemoryRecordStore>,
        metrics: Arc<RecordingSink>,
        engine: ReconcileEngine,
    }

    fn fixture(task_timeout: u64, queue_private: bool) -> Fixture {
        let mut cfg = Config::from_env();
        cfg.max_queue_size = 8;
        cfg.task_timeout = task_timeout;
        cfg.model_name = "m".to_owned();
        cfg.queue_private = queue_private;
        let queue = Arc::new(InMemoryQueue::new(8));
        let store = Arc::new(MemoryRecordStore::new());
        let metrics = Arc::new(RecordingSink::default());
        let distributor = TaskDistributor::new(queue.clone(), &cfg);
        let engine = ReconcileEngine::new(distributor, store.clone(), metrics.clone(), &cfg);
        Fixture {
            queue,
            store,
            metrics,
            engine,
        }
    }

    fn payload_json(task_id: &str) -> String {
        serde_json::to_string(&PredictionPayload {
            request: InferRequest {
                model_name: "m".to_owned(),
                inputs: Map::new(),
            },
            id: task_id.to_owned(),
            api_version: "v1".to_owned(),
        })
        .unwrap()
    }

    fn idle_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive for the duration of the test.
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn archived_sweep_marks_failed_and_removes_entry() {
        let f = fixture(1, true);
        f.store
            .create_task("t1", "u", "m", Some(TaskStatus::Running), 0)
            .await
            .unwrap();
        let queue_id = f.queue.push_state(
            QUEUE_CRITICAL,
            QueueState::Archived,
            &payload_json("t1"),
            Some(chrono::Utc::now()),
        );

        assert_eq!(f.engine.check_archived_tasks().await, 1);
        assert_eq!(f.store.peek("t1").unwrap().status, TaskStatus::Failed);
        assert_eq!(f.queue.state_of(QUEUE_CRITICAL, &queue_id), None);
    }

    #[tokio::test]
    async fn archived_sweep_never_overwrites_a_terminal_record() {
        let f = fixture(1, true);
        f.store
            .create_task("done", "u", "m", Some(TaskStatus::Succeeded), 0)
            .await
            .unwrap();
        let queue_id = f.queue.push_state(
            QUEUE_CRITICAL,
            QueueState::Archived,
            &payload_json("done"),
            Some(chrono::Utc::now()),
        );

        assert_eq!(f.engine.check_archived_tasks().await, 1);
        assert_eq!(f.store.peek("done").unwrap().status, TaskStatus::Succeeded);
        assert_eq!(f.queue.state_of(QUEUE_CRITICAL, &queue_id), None);
    }

    #[tokio::test]
    async fn archived_sweep_keeps_entry_inside_grace_window() {
        let f = fixture(1, true);
        f.store
            .create_task("t2", "u", "m", Some(TaskStatus::Running), 0)
            .await
            .unwrap();
        f.store.set_fail_updates(true);
        let queue_id = f.queue.push_state(
            QUEUE_CRITICAL,
            QueueState::Archived,
            &payload_json("t2"),
            Some(chrono::Utc::now()),
        );

        assert_eq!(f.engine.check_archived_tasks().await, 0);
        assert_eq!(
            f.queue.state_of(QUEUE_CRITICAL, &queue_id),
            Some(QueueState::Archived)
        );
    }

    #[tokio::test]
    async fn archived_sweep_drops_entry_past_grace_window() {
        let f = fixture(1, true);
        f.store
            .create_task("t3", "u", "m", Some(TaskStatus::Running), 0)
            .await
            .unwrap();
        f.store.set_fail_updates(true);
        let stale = chrono::Utc::now() - chrono::Duration::hours(13);
        let queue_id = f.queue.push_state(
            QUEUE_CRITICAL,
            QueueState::Archived,
            &payload_json("t3"),
            Some(stale),
        );

        assert_eq!(f.engine.check_archived_tasks().await, 1);
        assert_eq!(f.queue.state_of(QUEUE_CRITICAL, &queue_id), None);
        // Record untouched: the store was down the whole time.
        assert_eq!(f.store.peek("t3").unwrap().status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn stale_sweep_forces_only_vanished_unchanged_tasks() {
        let f = fixture(0, true);
        // Stuck: running record, no queue entry.
        f.store
            .create_task("stuck", "u", "m", Some(TaskStatus::Running), 0)
            .await
            .unwrap();
        // Healthy: pending record whose queue entry still exists.
        f.store
            .create_task("queued", "u", "m", Some(TaskStatus::Pending), 0)
            .await
            .unwrap();
        let queue_id =
            f.queue
                .push_state(QUEUE_CRITICAL, QueueState::Pending, &payload_json("queued"), None);
        f.store
            .update_task(&TaskUpdate::new("queued").queue_id(&queue_id))
            .await
            .unwrap();

        let forced = f.engine.check_task_status(idle_shutdown()).await;

        assert_eq!(forced, 1);
        let stuck = f.store.peek("stuck").unwrap();
        assert_eq!(stuck.status, TaskStatus::Failed);
        assert_eq!(stuck.error_info, "Unknown failure");
        assert_eq!(f.store.peek("queued").unwrap().status, TaskStatus::Pending);
        assert_eq!(f.metrics.forced_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn periodic_loop_runs_a_round_before_the_first_sleep() {
        let f = fixture(0, true);
        // Orphaned by a crash before this process came up: running record,
        // no queue entry.
        f.store
            .create_task("orphan", "u", "m", Some(TaskStatus::Running), 0)
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let engine = Arc::new(f.engine);
        let worker = tokio::spawn({
            let engine = engine.clone();
            async move { engine.periodic_check(rx).await }
        });

        // Well inside the first interval; only a startup round can have
        // reconciled the orphan.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.store.peek("orphan").unwrap().status, TaskStatus::Failed);

        tx.send(true).unwrap();
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn stale_sweep_skips_tasks_that_progressed_during_the_wait() {
        let f = fixture(0, true);
        f.store
            .create_task("moved", "u", "m", Some(TaskStatus::Pending), 0)
            .await
            .unwrap();
        // Progressed after sampling: listed as pending, becomes running.
        // With a zero wait the re-read happens immediately; simulate the
        // transition before the sweep re-reads.
        f.store
            .update_task(&TaskUpdate::new("moved").status(TaskStatus::Running))
            .await
            .unwrap();

        // "moved" is sampled under running too, so it is judged unchanged
        // there; give it a live queue entry to prove the queue check guards
        // it as well.
        let queue_id =
            f.queue
                .push_state(QUEUE_CRITICAL, QueueState::Active, &payload_json("moved"), None);
        f.store
            .update_task(&TaskUpdate::new("moved").queue_id(&queue_id))
            .await
            .unwrap();

        let forced = f.engine.check_task_status(idle_shutdown()).await;

        assert_eq!(forced, 0);
        assert_eq!(f.store.peek("moved").unwrap().status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_sweep_rewrites_expired_records() {
        let f = fixture(1, true);
        f.store
            .create_task("gone", "u", "m", Some(TaskStatus::Running), 0)
            .await
            .unwrap();

        // Expire the record during the sweep's wait, after sampling.
        let sweep = f.engine.check_task_status(idle_shutdown());
        let expire = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            f.store.expire("gone");
        };
        let (forced, ()) = tokio::join!(sweep, expire);

        assert_eq!(forced, 1);
        assert_eq!(f.metrics.forced_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn drain_fails_and_deletes_every_waiting_entry() {
        let f = fixture(1, true);
        for id in ["d1", "d2", "d3"] {
            f.store
                .create_task(id, "u", "m", Some(TaskStatus::Pending), 0)
                .await
                .unwrap();
        }
        f.queue
            .push_state(QUEUE_CRITICAL, QueueState::Scheduled, &payload_json("d1"), None);
        f.queue
            .push_state(QUEUE_CRITICAL, QueueState::Scheduled, &payload_json("d2"), None);
        f.queue
            .push_state(QUEUE_CRITICAL, QueueState::Pending, &payload_json("d3"), None);

        assert_eq!(f.engine.shutdown_drain().await, 3);
        for id in ["d1", "d2", "d3"] {
            let info = f.store.peek(id).unwrap();
            assert_eq!(info.status, TaskStatus::Failed);
            assert_eq!(info.error_info, "the task queue was closed");
        }
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.backlog(), 0);
    }

    #[tokio::test]
    async fn drain_is_a_noop_on_a_shared_queue() {
        let f = fixture(1, false);
        f.queue
            .push_state(QUEUE_CRITICAL, QueueState::Pending, &payload_json("d4"), None);

        assert_eq!(f.engine.shutdown_drain().await, 0);
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.backlog(), 1);
    }
}
