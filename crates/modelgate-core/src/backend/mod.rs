//! Backend invocation adapters.
//!
//! A uniform capability over heterogeneous inference platforms.  Each
//! adapter owns its platform's wire protocol and delivery policy (retry,
//! backoff, completion polling); callers only see [`Backend`] and the
//! [`BackendError`] taxonomy.

mod error;
mod k8s;
mod kserve;
mod mock;
mod replicate;
mod runpod;

pub use error::BackendError;
pub use k8s::K8sBackend;
pub use kserve::KserveBackend;
pub use mock::MockBackend;
pub use replicate::ReplicateBackend;
pub use runpod::RunpodBackend;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{Config, Platform};
use crate::task::{DocsRequest, InferRequest, InferResponse};

/// A single frame of a streaming generation response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    pub id: i64,
    pub data: String,
}

/// Incremental frames from a streaming backend.  Dropping the stream
/// abandons the underlying call; frames are never replayed.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<StreamFrame, BackendError>> + Send>>;

/// Uniform capability over one inference platform.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run one prediction to completion.
    async fn predict(
        &self,
        request: &InferRequest,
        api_version: &str,
    ) -> Result<InferResponse, BackendError>;

    /// Run a streaming generation, yielding frames as they arrive.
    async fn generate(
        &self,
        request: &InferRequest,
        api_version: &str,
    ) -> Result<FrameStream, BackendError>;

    /// Fetch the model's input documentation.
    async fn docs(&self, request: &DocsRequest) -> Result<Value, BackendError>;
}

/// Build the adapter selected by `MG_ML_PLATFORM`.
pub fn build_backend(config: &Config) -> Result<Arc<dyn Backend>, BackendError> {
    match config.ml_platform {
        Some(Platform::Kserve) => Ok(Arc::new(KserveBackend::new(config))),
        Some(Platform::K8s) => Ok(Arc::new(K8sBackend::new(config))),
        Some(Platform::Replicate) => Ok(Arc::new(ReplicateBackend::new(config))),
        Some(Platform::Runpod) => Ok(Arc::new(RunpodBackend::new(config))),
        None => Err(BackendError::Internal(
            "ML platform is not set".to_owned(),
        )),
    }
}

/// Strip gateway-internal fields from the inputs forwarded to a hosted
/// platform (the upload webhook is meaningful only to KServe-style
/// deployments).
pub(crate) fn hosted_inputs(request: &InferRequest) -> serde_json::Map<String, Value> {
    let mut inputs = request.inputs.clone();
    inputs.remove("upload_webhook");
    inputs
}
