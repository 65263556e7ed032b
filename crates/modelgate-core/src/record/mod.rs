//! External task-record store capability.
//!
//! The record store is the single source of truth callers observe; the core
//! only consumes and mutates it through this narrow interface.  A real
//! deployment talks HTTP ([`HttpRecordStore`]); tests use the in-memory
//! [`MemoryRecordStore`].

mod http;
mod memory;

pub use http::HttpRecordStore;
pub use memory::MemoryRecordStore;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::task::{TaskInfo, TaskStatus, TaskUpdate};

/// Errors surfaced by a record-store implementation.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to marshal task info")]
    Marshal,

    #[error("failed to send record-store request: {0}")]
    Send(String),

    #[error("record-store request failed, status code: {code}, error: {message}")]
    Status { code: u16, message: String },

    #[error("failed to decode record-store response: {0}")]
    Decode(String),

    #[error("task {0} not found")]
    NotFound(String),
}

/// Narrow capability over the durable task-record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a task record.  `status` of `None` leaves the store's default
    /// in place; `queue_position` records the backlog size observed at
    /// submission.  Returns the store's opaque response body.
    async fn create_task(
        &self,
        id: &str,
        user_id: &str,
        model_name: &str,
        status: Option<TaskStatus>,
        queue_position: usize,
    ) -> Result<Value, RecordError>;

    /// Apply a single mutation to an existing record.
    async fn update_task(&self, update: &TaskUpdate) -> Result<(), RecordError>;

    /// Fetch a record as the store returns it.
    async fn get_task(&self, id: &str) -> Result<Value, RecordError>;

    /// Fetch a record decoded into [`TaskInfo`].
    async fn get_task_typed(&self, id: &str) -> Result<TaskInfo, RecordError>;

    /// IDs of records for `model_name` currently in `status`.  An empty
    /// result set is an empty vec, never an error.
    async fn list_ids_by_model_status(
        &self,
        model_name: &str,
        status: TaskStatus,
    ) -> Result<Vec<String>, RecordError>;
}
