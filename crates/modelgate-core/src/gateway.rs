//! Request-facing orchestration.
//!
//! The host binary's routes stay thin; every multi-step flow (synchronous
//! prediction, asynchronous submission, cancellation) lives here so its
//! ordering guarantees are testable without HTTP.  The invariant throughout:
//! the record store is updated to reflect what actually happened to the
//! queue, never the other way around.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, FrameStream};
use crate::config::{Config, Platform};
use crate::distributor::TaskDistributor;
use crate::metrics::MetricsSink;
use crate::queue::{QueueError, QUEUE_CRITICAL};
use crate::record::{RecordError, RecordStore};
use crate::task::{
    extract_running_time, DocsRequest, InferRequest, PredictionPayload, TaskStatus, TaskUpdate,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("the prediction task queue is full, please wait for a while")]
    QueueFull,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Outcome of a `delete_pending` round.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct PendingDeletion {
    pub num_of_pending_tasks: usize,
    pub num_of_deleted_tasks: usize,
}

pub struct Gateway {
    distributor: TaskDistributor,
    store: Arc<dyn RecordStore>,
    backend: Arc<dyn Backend>,
    metrics: Arc<dyn MetricsSink>,
    model_name: String,
    /// Injected into inputs on KServe-style deployments so the model can
    /// push artifacts back.
    upload_webhook: Option<String>,
}

impl Gateway {
    pub fn new(
        distributor: TaskDistributor,
        store: Arc<dyn RecordStore>,
        backend: Arc<dyn Backend>,
        metrics: Arc<dyn MetricsSink>,
        config: &Config,
    ) -> Self {
        let upload_webhook = match (config.ml_platform, &config.upload_webhook_address) {
            (Some(Platform::Kserve) | Some(Platform::K8s), Some(addr)) if !addr.is_empty() => {
                Some(format!("http://{addr}/upload"))
            }
            _ => None,
        };
        Self {
            distributor,
            store,
            backend,
            metrics,
            model_name: config.model_name.clone(),
            upload_webhook,
        }
    }

    fn decorate(&self, request: &mut InferRequest) {
        if let Some(url) = &self.upload_webhook {
            request
                .inputs
                .insert("upload_webhook".to_owned(), Value::String(url.clone()));
        }
    }

    /// Synchronous prediction: the record is created `running`, the backend
    /// is invoked inline, and the stored terminal record is returned.
    pub async fn predict(
        &self,
        user_id: &str,
        mut request: InferRequest,
        api_version: &str,
    ) -> Result<Value, GatewayError> {
        self.decorate(&mut request);
        let id = Uuid::new_v4().to_string();
        self.store
            .create_task(&id, user_id, &request.model_name, Some(TaskStatus::Running), 0)
            .await?;

        let response = match self.backend.predict(&request, api_version).await {
            Ok(response) => response,
            Err(e) => {
                let update = TaskUpdate::new(&id)
                    .status(TaskStatus::Failed)
                    .error_info(e.to_string());
                if let Err(record_err) = self.store.update_task(&update).await {
                    error!(task_id = %id, error = %record_err, "failed to mark task failed");
                }
                return Err(e.into());
            }
        };

        let mut outputs = response.outputs;
        let running_time = extract_running_time(&mut outputs);
        if let Some(seconds) = running_time.as_ref().and_then(|rt| rt.seconds) {
            self.metrics.observe_running_time(seconds);
        }
        let mut update = TaskUpdate::new(&id)
            .status(TaskStatus::Succeeded)
            .outputs(Value::Object(outputs));
        if let Some(rt) = running_time {
            update = update.running_time(rt.display);
        }
        self.store.update_task(&update).await?;
        Ok(self.store.get_task(&id).await?)
    }

    pub async fn generate(
        &self,
        mut request: InferRequest,
        api_version: &str,
    ) -> Result<FrameStream, GatewayError> {
        self.decorate(&mut request);
        Ok(self.backend.generate(&request, api_version).await?)
    }

    pub async fn docs(&self, request: &DocsRequest) -> Result<Value, GatewayError> {
        Ok(self.backend.docs(request).await?)
    }

    /// Asynchronous submission: admission check, record creation, enqueue,
    /// queue-id bind.  Every failure path leaves the record store and the
    /// queue consistent with each other.
    pub async fn submit_prediction(
        &self,
        user_id: &str,
        mut request: InferRequest,
        api_version: &str,
    ) -> Result<String, GatewayError> {
        self.decorate(&mut request);

        let backlog = match self.distributor.queue_size().await {
            Ok(backlog) => backlog,
            Err(e) => {
                // An unreadable queue should not block submission.
                warn!(error = %e, "failed to read queue size, admitting");
                0
            }
        };
        if !self.distributor.admit(backlog) {
            error!(backlog, "the task queue is full, cannot add more tasks");
            return Err(GatewayError::QueueFull);
        }

        let id = Uuid::new_v4().to_string();
        self.store
            .create_task(&id, user_id, &request.model_name, None, backlog)
            .await?;

        let payload = PredictionPayload {
            request,
            id: id.clone(),
            api_version: api_version.to_owned(),
        };
        let queue_id = match self.distributor.enqueue_prediction(&payload).await {
            Ok(queue_id) => queue_id,
            Err(e) => {
                let update = TaskUpdate::new(&id)
                    .status(TaskStatus::Failed)
                    .error_info("task queue failed");
                if let Err(record_err) = self.store.update_task(&update).await {
                    error!(task_id = %id, error = %record_err, "failed to mark task failed");
                }
                return Err(e.into());
            }
        };

        let bind = TaskUpdate::new(&id).queue_id(&queue_id);
        if let Err(e) = self.store.update_task(&bind).await {
            // A record without its queue_id can never be canceled; drop the
            // entry rather than leaving it unaddressable.
            error!(task_id = %id, error = %e, "failed to bind queue id, deleting entry");
            if let Err(queue_err) = self.distributor.delete_task(QUEUE_CRITICAL, &queue_id).await {
                error!(queue_id = %queue_id, error = %queue_err, "failed to delete task from queue");
            }
            return Err(e.into());
        }
        Ok(id)
    }

    pub async fn get_task(&self, id: &str) -> Result<Value, GatewayError> {
        Ok(self.store.get_task(id).await?)
    }

    /// Cancel a submitted task.  The queue entry is removed first; the
    /// record transitions to `canceled` only once the entry is provably
    /// gone, so a worker can never pick up a task the caller believes
    /// canceled.
    pub async fn cancel_task(&self, id: &str) -> Result<(), GatewayError> {
        let info = self.store.get_task_typed(id).await?;
        self.distributor
            .delete_task(QUEUE_CRITICAL, &info.queue_id)
            .await?;
        let update = TaskUpdate::new(id).status(TaskStatus::Canceled);
        self.store.update_task(&update).await?;
        info!(task_id = %id, "task canceled");
        Ok(())
    }

    /// Remove the queue entries of every `pending` record for the
    /// configured model.  Records are left for the stale-status sweep to
    /// fold over; failures on individual tasks are skipped, not fatal.
    pub async fn delete_pending(&self) -> Result<PendingDeletion, GatewayError> {
        let ids = self
            .store
            .list_ids_by_model_status(&self.model_name, TaskStatus::Pending)
            .await?;
        let pending = ids.len();

        let mut deleted = 0;
        for id in ids {
            let Ok(info) = self.store.get_task_typed(&id).await else {
                continue;
            };
            if self
                .distributor
                .delete_task(QUEUE_CRITICAL, &info.queue_id)
                .await
                .is_err()
            {
                continue;
            }
            deleted += 1;
        }
        Ok(PendingDeletion {
            num_of_pending_tasks: pending,
            num_of_deleted_tasks: deleted,
        })
    }

    pub async fn queue_size(&self) -> Result<usize, GatewayError> {
        Ok(self.distributor.queue_size().await?)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::MockBackend;
    use crate::metrics::RecordingSink;
    use crate::queue::{InMemoryQueue, QueueState, TaskQueue};
    use crate::record::MemoryRecordStore;
    use crate::task::InferResponse;
    use serde_json::{json, Map};

    struct Fixture {
        queue: Arc<InMemoryQueue>,
        store: Arc<MemoryRecordStore>,
        backend: Arc<MockBackend>,
        gateway: Gateway,
    }

    fn fixture(max_queue_size: usize) -> Fixture {
        let mut cfg = Config::from_env();
        cfg.max_queue_size = max_queue_size;
        cfg.model_name = "m".to_owned();
        let queue = Arc::new(InMemoryQueue::new(max_queue_size));
        let store = Arc::new(MemoryRecordStore::new());
        let backend = Arc::new(MockBackend::new());
        let metrics = Arc::new(RecordingSink::default());
        let distributor = TaskDistributor::new(queue.clone(), &cfg);
        let gateway = Gateway::new(distributor, store.clone(), backend.clone(), metrics, &cfg);
        Fixture {
            queue,
            store,
            backend,
            gateway,
        }
    }

    fn request() -> InferRequest {
        InferRequest {
            model_name: "m".to_owned(),
            inputs: Map::new(),
        }
    }

    #[tokio::test]
    async fn admission_allows_up_to_the_bound_then_rejects() {
        let f = fixture(2);
        f.gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();
        f.gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();

        let rejected = f.gateway.submit_prediction("u", request(), "v1").await;
        assert!(matches!(rejected, Err(GatewayError::QueueFull)));
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.backlog(), 2);
    }

    #[tokio::test]
    async fn submission_binds_queue_id_to_the_record() {
        let f = fixture(4);
        let id = f
            .gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();
        let info = f.store.peek(&id).unwrap();
        assert!(!info.queue_id.is_empty());
        assert_eq!(
            f.queue.state_of(QUEUE_CRITICAL, &info.queue_id),
            Some(QueueState::Pending)
        );
    }

    #[tokio::test]
    async fn failed_queue_id_bind_removes_the_entry() {
        let f = fixture(4);
        // create_task is unaffected by the update toggle, so submission
        // reaches the bind step and fails there.
        f.store.set_fail_updates(true);
        let result = f.gateway.submit_prediction("u", request(), "v1").await;
        assert!(result.is_err());
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.backlog(), 0);
    }

    #[tokio::test]
    async fn cancel_aborts_when_the_queue_delete_fails() {
        let f = fixture(4);
        let id = f
            .gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();
        f.queue.set_fail_deletes(true);

        let result = f.gateway.cancel_task(&id).await;
        assert!(result.is_err());
        // The record must not claim canceled while the entry is live.
        assert_eq!(f.store.peek(&id).unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_transitions_the_record_once_the_entry_is_gone() {
        let f = fixture(4);
        let id = f
            .gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();

        f.gateway.cancel_task(&id).await.unwrap();
        let info = f.store.peek(&id).unwrap();
        assert_eq!(info.status, TaskStatus::Canceled);
        assert_eq!(f.queue.state_of(QUEUE_CRITICAL, &info.queue_id), None);
    }

    #[tokio::test]
    async fn sync_predict_returns_the_stored_terminal_record() {
        let f = fixture(4);
        let mut outputs = Map::new();
        outputs.insert("output".to_owned(), json!("ok"));
        outputs.insert("running_time".to_owned(), json!("2.0s"));
        f.backend.push_response(InferResponse { outputs });

        let record = f.gateway.predict("u", request(), "v1").await.unwrap();
        assert_eq!(record["status"], json!("succeeded"));
        assert_eq!(record["running_time"], json!("2.0s"));
        assert_eq!(record["outputs"]["output"], json!("ok"));
    }

    #[tokio::test]
    async fn sync_predict_failure_is_recorded() {
        let f = fixture(4);
        f.backend
            .push_error(BackendError::InvalidInput("bad inputs".to_owned()));

        let result = f.gateway.predict("u", request(), "v1").await;
        assert!(matches!(
            result,
            Err(GatewayError::Backend(BackendError::InvalidInput(_)))
        ));
        let failed = f
            .store
            .list_ids_by_model_status("m", TaskStatus::Failed)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
    }

    #[tokio::test]
    async fn delete_pending_counts_entries_it_removed() {
        let f = fixture(4);
        f.gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();
        f.gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();
        // One entry is already claimed by a worker; delete is idempotent
        // and removes it from the active bucket just the same.
        f.queue.claim(QUEUE_CRITICAL).await.unwrap().unwrap();

        let outcome = f.gateway.delete_pending().await.unwrap();
        assert_eq!(outcome.num_of_pending_tasks, 2);
        assert_eq!(outcome.num_of_deleted_tasks, 2);
        let snapshot = f.queue.snapshot(QUEUE_CRITICAL).await.unwrap();
        assert_eq!(snapshot.backlog() + snapshot.active, 0);
    }

    #[tokio::test]
    async fn submission_adds_the_upload_webhook_for_in_cluster_platforms() {
        let mut cfg = Config::from_env();
        cfg.max_queue_size = 4;
        cfg.model_name = "m".to_owned();
        cfg.ml_platform = Some(Platform::K8s);
        cfg.upload_webhook_address = Some("hooks.internal:9090".to_owned());
        let queue = Arc::new(InMemoryQueue::new(4));
        let store = Arc::new(MemoryRecordStore::new());
        let distributor = TaskDistributor::new(queue.clone(), &cfg);
        let gateway = Gateway::new(
            distributor,
            store,
            Arc::new(MockBackend::new()),
            Arc::new(RecordingSink::default()),
            &cfg,
        );

        gateway
            .submit_prediction("u", request(), "v1")
            .await
            .unwrap();

        let entries = queue
            .list(QUEUE_CRITICAL, QueueState::Pending)
            .await
            .unwrap();
        let payload: PredictionPayload = serde_json::from_str(&entries[0].payload).unwrap();
        assert_eq!(
            payload.request.inputs.get("upload_webhook"),
            Some(&json!("http://hooks.internal:9090/upload"))
        );
    }
}
