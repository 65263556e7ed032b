//! K8s plugin adapter.
//!
//! A plain HTTP forwarder for models deployed behind an in-cluster plugin
//! service: requests go to `http://{address}/v1/predict` with no host-header
//! routing and no retry policy.  Streaming generation is not offered by the
//! plugin protocol.

use std::time::Duration;

use serde_json::Value;

use super::{Backend, BackendError, FrameStream};
use crate::config::Config;
use crate::task::{DocsRequest, InferRequest, InferResponse};

const DOCS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct K8sBackend {
    client: reqwest::Client,
    address: String,
    timeout: Duration,
}

impl K8sBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: config.k8s_plugin_address.clone(),
            timeout: Duration::from_secs(config.k8s_plugin_request_timeout),
        }
    }

    /// Single-shot send; a transport failure means the model is not ready
    /// and any non-200 status is a permanent input error.
    async fn send_request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<reqwest::Response, BackendError> {
        let res = self
            .client
            .request(method, url)
            .header("Content-Type", "application/json")
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|_| {
                BackendError::SendRequest(format!(
                    "url: {url}, failed to send request, model not ready"
                ))
            })?;
        let status = res.status().as_u16();
        if status != 200 {
            let message = res.text().await.unwrap_or_default();
            return Err(BackendError::InvalidInput(format!(
                "url: {url}, status-code: {status}, error: {message}"
            )));
        }
        Ok(res)
    }

    async fn decode(res: reqwest::Response) -> Result<Value, BackendError> {
        let body = res
            .bytes()
            .await
            .map_err(|e| BackendError::ReadResponse(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| BackendError::UnmarshalResponse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Backend for K8sBackend {
    async fn predict(
        &self,
        request: &InferRequest,
        api_version: &str,
    ) -> Result<InferResponse, BackendError> {
        if api_version != "v1" {
            return Err(BackendError::UnknownApiVersion(api_version.to_owned()));
        }
        // The plugin receives the whole request envelope, model name
        // included; it does its own routing.
        let data = serde_json::to_vec(request).map_err(|_| BackendError::Marshal)?;
        let url = format!("http://{}/v1/predict", self.address);
        let res = self
            .send_request(reqwest::Method::POST, &url, data, self.timeout)
            .await?;

        let body = res
            .bytes()
            .await
            .map_err(|e| BackendError::ReadResponse(e.to_string()))?;
        let outputs = serde_json::from_slice(&body)
            .map_err(|e| BackendError::UnmarshalResponse(e.to_string()))?;
        Ok(InferResponse { outputs })
    }

    async fn generate(
        &self,
        _request: &InferRequest,
        api_version: &str,
    ) -> Result<FrameStream, BackendError> {
        Err(BackendError::UnknownApiVersion(api_version.to_owned()))
    }

    async fn docs(&self, request: &DocsRequest) -> Result<Value, BackendError> {
        let data = serde_json::to_vec(request).map_err(|_| BackendError::Marshal)?;
        let url = format!("http://{}/v1/docs", self.address);
        let res = self
            .send_request(reqwest::Method::GET, &url, data, DOCS_TIMEOUT)
            .await?;
        Self::decode(res).await
    }
}
