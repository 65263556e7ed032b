//! Scripted backend for processor and route tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::Value;

use super::{Backend, BackendError, FrameStream};
use crate::task::{DocsRequest, InferRequest, InferResponse};

/// Replays a queue of scripted predict outcomes in order.  An empty
/// script yields an internal error, which keeps a mis-scripted test
/// loud instead of hanging.
#[derive(Default)]
pub struct MockBackend {
    script: Mutex<VecDeque<Result<InferResponse, BackendError>>>,
    calls: AtomicUsize,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: InferResponse) {
        self.script.lock().unwrap().push_back(Ok(response));
    }

    pub fn push_error(&self, error: BackendError) {
        self.script.lock().unwrap().push_back(Err(error));
    }

    /// Number of predict calls observed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Backend for MockBackend {
    async fn predict(
        &self,
        _request: &InferRequest,
        _api_version: &str,
    ) -> Result<InferResponse, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::Internal("no scripted response".to_owned())))
    }

    async fn generate(
        &self,
        _request: &InferRequest,
        api_version: &str,
    ) -> Result<FrameStream, BackendError> {
        Err(BackendError::UnknownApiVersion(api_version.to_owned()))
    }

    async fn docs(&self, _request: &DocsRequest) -> Result<Value, BackendError> {
        Ok(Value::String(String::new()))
    }
}
