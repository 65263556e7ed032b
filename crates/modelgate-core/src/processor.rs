//! Claim-execute-commit workers over the critical queue.
//!
//! Each worker claims one queue entry at a time, marks the task record
//! `running`, invokes the backend bounded by the task timeout, and commits
//! the terminal status back to the record store.  The commit decides the
//! queue outcome: record-store failures nack (the lease retries the
//! attempt), backend failures ack after the record is marked `failed`
//! (re-running inference against a broken request would only fail again).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendError};
use crate::distributor::TaskDistributor;
use crate::metrics::MetricsSink;
use crate::queue::ClaimedTask;
use crate::record::RecordStore;
use crate::task::{extract_running_time, PredictionPayload, TaskStatus, TaskUpdate};

const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Clone)]
pub struct TaskProcessor {
    distributor: TaskDistributor,
    store: Arc<dyn RecordStore>,
    backend: Arc<dyn Backend>,
    metrics: Arc<dyn MetricsSink>,
    task_timeout: Duration,
    concurrency: usize,
}

impl TaskProcessor {
    pub fn new(
        distributor: TaskDistributor,
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn Backend>,
        metrics: Arc<dyn MetricsSink>,
        task_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            distributor,
            store,
            backend,
            metrics,
            task_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Spawn the worker pool.  Workers drain until `shutdown` flips, then
    /// finish their in-flight task and exit.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.concurrency)
            .map(|worker| {
                let processor = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(worker, "task worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let claimed = match processor.distributor.claim().await {
                            Ok(claimed) => claimed,
                            Err(e) => {
                                error!(worker, error = %e, "failed to claim task");
                                None
                            }
                        };
                        match claimed {
                            Some(task) => processor.process_one(task).await,
                            None => {
                                tokio::select! {
                                    _ = shutdown.changed() => {}
                                    _ = tokio::time::sleep(IDLE_WAIT) => {}
                                }
                            }
                        }
                    }
                    info!(worker, "task worker stopped");
                })
            })
            .collect()
    }

    /// Execute one claimed queue entry end to end.
    pub async fn process_one(&self, claimed: ClaimedTask) {
        let payload: PredictionPayload = match serde_json::from_str(&claimed.payload) {
            Ok(payload) => payload,
            Err(e) => {
                // Poison entry: retrying cannot fix it, drop it from the queue.
                warn!(queue_id = %claimed.id, error = %e, "undecodable task payload, dropping");
                self.ack(&claimed.id).await;
                return;
            }
        };
        let task_id = payload.id.clone();

        let running = TaskUpdate::new(&task_id).status(TaskStatus::Running);
        if let Err(e) = self.store.update_task(&running).await {
            warn!(task_id = %task_id, error = %e, "failed to mark task running, retrying later");
            self.nack(&claimed.id).await;
            return;
        }

        let outcome = tokio::time::timeout(
            self.task_timeout,
            self.backend.predict(&payload.request, &payload.api_version),
        )
        .await
        .unwrap_or(Err(BackendError::Timeout(self.task_timeout.as_secs())));

        match outcome {
            Ok(response) => {
                let mut outputs = response.outputs;
                let running_time = extract_running_time(&mut outputs);
                if let Some(seconds) = running_time.as_ref().and_then(|rt| rt.seconds) {
                    self.metrics.observe_running_time(seconds);
                }
                let mut update = TaskUpdate::new(&task_id)
                    .status(TaskStatus::Succeeded)
                    .outputs(Value::Object(outputs));
                if let Some(rt) = running_time {
                    update = update.running_time(rt.display);
                }
                if let Err(e) = self.store.update_task(&update).await {
                    // The work is done but the record is not; redeliver so
                    // the commit gets another chance.
                    error!(task_id = %task_id, error = %e, "failed to commit succeeded task");
                    self.nack(&claimed.id).await;
                    return;
                }
                info!(task_id = %task_id, "task succeeded");
                self.ack(&claimed.id).await;
            }
            Err(backend_error) => {
                self.metrics.incr_predict_failures();
                let update = TaskUpdate::new(&task_id)
                    .status(TaskStatus::Failed)
                    .error_info(backend_error.to_string());
                if let Err(e) = self.store.update_task(&update).await {
                    error!(task_id = %task_id, error = %e, "failed to mark task failed");
                    self.nack(&claimed.id).await;
                    return;
                }
                warn!(task_id = %task_id, error = %backend_error, "task failed");
                self.ack(&claimed.id).await;
            }
        }
    }

    async fn ack(&self, queue_id: &str) {
        if let Err(e) = self.distributor.ack(queue_id).await {
            error!(queue_id = %queue_id, error = %e, "failed to ack task");
        }
    }

    async fn nack(&self, queue_id: &str) {
        if let Err(e) = self.distributor.nack(queue_id).await {
            error!(queue_id = %queue_id, error = %e, "failed to nack task");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::MockBackend;
    use crate::config::Config;
    use crate::metrics::RecordingSink;
    use crate::queue::{InMemoryQueue, QueueState, TaskQueue, QUEUE_CRITICAL};
    use crate::record::MemoryRecordStore;
    use crate::task::InferRequest;
    use serde_json::{json, Map};
    use std::sync::atomic::Ordering;

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        store: Arc<MemoryRecordStore>,
        backend: Arc<MockBackend>,
        metrics: Arc<RecordingSink>,
        processor: TaskProcessor,
    }

    fn fixture() -> Fixture {
        let mut cfg = Config::from_env();
        cfg.max_queue_size = 8;
        let queue = Arc::new(InMemoryQueue::new(8));
        let store = Arc::new(MemoryRecordStore::new());
        let backend = Arc::new(MockBackend::new());
        let metrics = Arc::new(RecordingSink::default());
        let distributor = TaskDistributor::new(queue.clone(), &cfg);
        let processor = TaskProcessor::new(
            distributor,
            store.clone(),
            backend.clone(),
            metrics.clone(),
            Duration::from_secs(5),
            1,
        );
        Fixture {
            queue,
            store,
            backend,
            metrics,
            processor,
        }
    }

    async fn submit(f: &Fixture, task_id: &str) -> ClaimedTask {
        f.store
            .create_task(task_id, "u", "m", Some(TaskStatus::Pending), 0)
            .await
            .unwrap();
        let payload = PredictionPayload {
            request: InferRequest {
                model_name: "m".to_owned(),
                inputs: Map::new(),
            },
            id: task_id.to_owned(),
            api_version: "v1".to_owned(),
        };
        f.processor
            .distributor
            .enqueue_prediction(&payload)
            .await
            .unwrap();
        f.processor.distributor.claim().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_commits_record_and_acks() {
        let f = fixture();
        let claimed = submit(&f, "t1").await;
        let mut outputs = Map::new();
        outputs.insert("output".to_owned(), json!("hello"));
        outputs.insert("running_time".to_owned(), json!("1.5s"));
        f.backend
            .push_response(crate::task::InferResponse { outputs });

        f.processor.process_one(claimed).await;

        let record = f.store.get_task_typed("t1").await.unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.running_time, "1.5s");
        assert_eq!(record.outputs["output"], json!("hello"));
        // Payload no longer carries running_time once it is extracted.
        assert!(record.outputs.get("running_time").is_none());
        assert_eq!(f.metrics.running_times(), vec![1.5]);
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test]
    async fn backend_failure_marks_failed_without_queue_retry() {
        let f = fixture();
        let claimed = submit(&f, "t2").await;
        f.backend
            .push_error(BackendError::Internal("boom".to_owned()));

        f.processor.process_one(claimed).await;

        let record = f.store.get_task_typed("t2").await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.error_info.contains("boom"));
        assert_eq!(f.metrics.predict_failures.load(Ordering::Relaxed), 1);
        // Acked, not retried.
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.retry, 0);
        assert_eq!(snapshot.active, 0);
    }

    #[tokio::test]
    async fn record_failure_nacks_for_redelivery() {
        let f = fixture();
        let claimed = submit(&f, "t3").await;
        f.store.set_fail_updates(true);

        f.processor.process_one(claimed).await;

        // The running write failed, so the entry must come back.
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.retry, 1);
        assert_eq!(f.backend.calls(), 0);
    }

    #[tokio::test]
    async fn submitted_task_flows_to_succeeded() {
        let f = fixture();
        let mut cfg = Config::from_env();
        cfg.max_queue_size = 8;
        cfg.model_name = "m".to_owned();
        let gateway = crate::gateway::Gateway::new(
            f.processor.distributor.clone(),
            f.store.clone(),
            f.backend.clone(),
            f.metrics.clone(),
            &cfg,
        );
        let mut outputs = Map::new();
        outputs.insert("output".to_owned(), json!(42));
        f.backend
            .push_response(crate::task::InferResponse { outputs });

        let request = InferRequest {
            model_name: "m".to_owned(),
            inputs: Map::new(),
        };
        let id = gateway.submit_prediction("u", request, "v1").await.unwrap();
        let claimed = f.processor.distributor.claim().await.unwrap().unwrap();
        f.processor.process_one(claimed).await;

        let record = f.store.get_task_typed(&id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.outputs["output"], json!(42));
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.backlog() + snapshot.active, 0);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let f = fixture();
        f.queue
            .push_state(QUEUE_CRITICAL, QueueState::Pending, "not json", None);
        let claimed = f.processor.distributor.claim().await.unwrap().unwrap();

        f.processor.process_one(claimed).await;

        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.retry, 0);
    }
}
