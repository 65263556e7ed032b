//! RunPod serverless adapter.
//!
//! Jobs are submitted to `{address}/{model}/run` and polled at
//! `{address}/{model}/status/{job_id}` until they finish.  RunPod
//! reports execution time in milliseconds; it is normalised to seconds
//! before it reaches the caller.

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use super::{hosted_inputs, Backend, BackendError, FrameStream};
use crate::config::Config;
use crate::task::{DocsRequest, InferRequest, InferResponse};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const THROTTLED_WAIT: Duration = Duration::from_secs(2);

pub struct RunpodBackend {
    client: reqwest::Client,
    address: String,
    api_key: String,
    model_id: String,
    timeout: Duration,
}

impl RunpodBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: config.runpod_address.clone(),
            api_key: config.runpod_api_key.clone(),
            model_id: config.runpod_model_id.clone(),
            timeout: Duration::from_secs(config.runpod_request_timeout),
        }
    }

    async fn send_request(
        &self,
        method: reqwest::Method,
        url: &str,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, BackendError> {
        let mut req = self
            .client
            .request(method, url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(self.timeout);
        if let Some(body) = body {
            req = req.body(body);
        }
        let res = req.send().await.map_err(|_| {
            BackendError::SendRequest("failed to send request, model not ready".to_owned())
        })?;
        let status = res.status().as_u16();
        if status == 429 {
            return Ok(res);
        }
        if status >= 400 {
            let message = res.text().await.unwrap_or_default();
            return Err(BackendError::Internal(format!(
                "request failed with status {status}: {message}"
            )));
        }
        Ok(res)
    }

    async fn decode(res: reqwest::Response) -> Result<Map<String, Value>, BackendError> {
        let body = res
            .bytes()
            .await
            .map_err(|e| BackendError::ReadResponse(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| BackendError::UnmarshalResponse(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Backend for RunpodBackend {
    async fn predict(
        &self,
        request: &InferRequest,
        _api_version: &str,
    ) -> Result<InferResponse, BackendError> {
        let submit = json!({ "input": hosted_inputs(request) });
        let data = serde_json::to_vec(&submit).map_err(|_| BackendError::Marshal)?;

        let run_url = format!("{}/{}/run", self.address, self.model_id);
        let res = self
            .send_request(reqwest::Method::POST, &run_url, Some(data))
            .await?;
        let outputs = Self::decode(res).await?;

        let job_id = outputs
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::ReadResponse("failed to read job id".to_owned()))?
            .to_owned();
        let status_url = format!("{}/{}/status/{}", self.address, self.model_id, job_id);

        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            let res = self
                .send_request(reqwest::Method::GET, &status_url, None)
                .await?;
            if res.status().as_u16() == 429 {
                tokio::time::sleep(THROTTLED_WAIT).await;
                continue;
            }
            let outputs = Self::decode(res).await?;
            let status = outputs
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::ReadResponse("failed to read job status".to_owned()))?;
            match status {
                "COMPLETED" => {
                    // executionTime is reported in milliseconds.
                    let execution_time = outputs
                        .get("executionTime")
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0)
                        / 1000.0;
                    let mut response = Map::new();
                    response.insert(
                        "output".to_owned(),
                        outputs.get("output").cloned().unwrap_or(Value::Null),
                    );
                    response.insert(
                        "running_time".to_owned(),
                        json!(format!("{execution_time:.6}s")),
                    );
                    return Ok(InferResponse { outputs: response });
                }
                "FAILED" => {
                    return Err(BackendError::Internal(format!(
                        "predict failed: {}",
                        Value::Object(outputs)
                    )));
                }
                _ => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
        Err(BackendError::Timeout(self.timeout.as_secs()))
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
