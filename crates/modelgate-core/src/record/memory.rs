//! In-memory record store used by tests and local development.
//!
//! Mirrors the HTTP store's observable behavior, including the failure
//! modes the reconciliation engine must tolerate: updates can be made to
//! fail wholesale, and individual records can be dropped to simulate key
//! expiration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;

use super::{RecordError, RecordStore};
use crate::task::{TaskInfo, TaskStatus, TaskUpdate};

#[derive(Default)]
pub struct MemoryRecordStore {
    tasks: Mutex<HashMap<String, TaskInfo>>,
    fail_updates: AtomicBool,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `update_task` fail, as if the store were down.
    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Drop a record, as if its backing key expired.
    pub fn expire(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Direct record read for test assertions (no failure simulation).
    pub fn peek(&self, id: &str) -> Option<TaskInfo> {
        self.lock().get(id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TaskInfo>> {
        self.tasks.lock().expect("record store mutex poisoned")
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create_task(
        &self,
        id: &str,
        _user_id: &str,
        _model_name: &str,
        status: Option<TaskStatus>,
        _queue_position: usize,
    ) -> Result<Value, RecordError> {
        let info = TaskInfo {
            id: id.to_owned(),
            status: status.unwrap_or(TaskStatus::Pending),
            running_time: String::new(),
            outputs: Value::Null,
            created_at: Utc::now(),
            error_info: String::new(),
            queue_id: String::new(),
        };
        self.lock().insert(id.to_owned(), info);
        Ok(serde_json::json!({ "id": id }))
    }

    async fn update_task(&self, update: &TaskUpdate) -> Result<(), RecordError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(RecordError::Send("record store unavailable".to_owned()));
        }
        let mut tasks = self.lock();
        let info = tasks
            .get_mut(&update.id)
            .ok_or_else(|| RecordError::NotFound(update.id.clone()))?;
        if let Some(status) = update.status {
            info.status = status;
        }
        if let Some(running_time) = &update.running_time {
            info.running_time = running_time.clone();
        }
        if let Some(outputs) = &update.outputs {
            info.outputs = outputs.clone();
        }
        if let Some(error_info) = &update.error_info {
            info.error_info = error_info.clone();
        }
        if let Some(queue_id) = &update.queue_id {
            info.queue_id = queue_id.clone();
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Value, RecordError> {
        let info = self.get_task_typed(id).await?;
        serde_json::to_value(info).map_err(|_| RecordError::Marshal)
    }

    async fn get_task_typed(&self, id: &str) -> Result<TaskInfo, RecordError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| RecordError::NotFound(id.to_owned()))
    }

    async fn list_ids_by_model_status(
        &self,
        _model_name: &str,
        status: TaskStatus,
    ) -> Result<Vec<String>, RecordError> {
        Ok(self
            .lock()
            .values()
            .filter(|info| info.status == status)
            .map(|info| info.id.clone())
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn created_task_is_fetched_with_the_same_id() {
        let store = MemoryRecordStore::new();
        store
            .create_task("t-1", "u-1", "llama", Some(TaskStatus::Running), 0)
            .await
            .unwrap();
        let raw = store.get_task("t-1").await.unwrap();
        assert_eq!(raw["id"], "t-1");
        assert_eq!(raw["status"], "running");
    }

    #[tokio::test]
    async fn empty_model_status_query_is_not_an_error() {
        let store = MemoryRecordStore::new();
        let ids = store
            .list_ids_by_model_status("llama", TaskStatus::Pending)
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn update_failure_toggle_leaves_record_untouched() {
        let store = MemoryRecordStore::new();
        store
            .create_task("t-1", "u-1", "llama", Some(TaskStatus::Pending), 0)
            .await
            .unwrap();
        store.set_fail_updates(true);
        let err = store
            .update_task(&TaskUpdate::new("t-1").status(TaskStatus::Failed))
            .await;
        assert!(err.is_err());
        assert_eq!(store.peek("t-1").unwrap().status, TaskStatus::Pending);
    }
}
