//! Replicate adapter.
//!
//! Submit-then-poll: a prediction is created with one POST, then its
//! status URL is polled once per second until it reports `succeeded` or
//! `failed`.  HTTP 429 lengthens the wait without counting against the
//! budget; the whole loop is bounded by the configured request timeout.

use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};

use super::{hosted_inputs, Backend, BackendError, FrameStream};
use crate::config::Config;
use crate::task::{DocsRequest, InferRequest, InferResponse};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const THROTTLED_WAIT: Duration = Duration::from_secs(2);

pub struct ReplicateBackend {
    client: reqwest::Client,
    address: String,
    api_key: String,
    model_id: String,
    timeout: Duration,
}

impl ReplicateBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: config.replicate_address.clone(),
            api_key: config.replicate_api_key.clone(),
            model_id: config.replicate_model_id.clone(),
            timeout: Duration::from_secs(config.replicate_request_timeout),
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
            .header("Authorization", format!("Token {}", self.api_key))
            .timeout(self.timeout);
        if let Some(body) = body {
            req = req.body(body);
        }
        let res = req.send().await.map_err(|_| {
            BackendError::SendRequest("failed to send request, model not ready".to_owned())
        })?;
        // 429 is a throttle signal the poll loop handles itself.
        let status = res.status().as_u16();
        if status > 300 && status != 429 {
            let message = res.text().await.unwrap_or_default();
            return Err(BackendError::InvalidInput(message));
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
impl Backend for ReplicateBackend {
    async fn predict(
        &self,
        request: &InferRequest,
        _api_version: &str,
    ) -> Result<InferResponse, BackendError> {
        let submit = json!({
            "version": self.model_id,
            "input": hosted_inputs(request),
        });
        let data = serde_json::to_vec(&submit).map_err(|_| BackendError::Marshal)?;

        let res = self
            .send_request(reqwest::Method::POST, &self.address, Some(data))
            .await?;
        let outputs = Self::decode(res).await?;

        let status_url = outputs
            .get("urls")
            .and_then(|urls| urls.get("get"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BackendError::ReadResponse("failed to read prediction 'get' url".to_owned())
            })?
            .to_owned();

        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            let res = self
                .send_request(reqwest::Method::GET, &status_url, None)
                .await?;
            if res.status().as_u16() == 429 {
                // Throttled: wait longer, without consuming the budget.
                tokio::time::sleep(THROTTLED_WAIT).await;
                continue;
            }
            let outputs = Self::decode(res).await?;
            let status = outputs
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    BackendError::ReadResponse("failed to read prediction status".to_owned())
                })?;
            match status {
                "succeeded" => {
                    let predict_time = outputs
                        .get("metrics")
                        .and_then(|m| m.get("predict_time"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    let mut response = Map::new();
                    response.insert(
                        "output".to_owned(),
                        outputs.get("output").cloned().unwrap_or(Value::Null),
                    );
                    response.insert(
                        "running_time".to_owned(),
                        json!(format!("{predict_time:.6}s")),
                    );
                    return Ok(InferResponse { outputs: response });
                }
                "failed" => {
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
