//! KServe adapter.
//!
//! Prediction requests go to `http://{addr}/v1/models/{model}:predict`
//! with a virtual-host header routing to the model's namespace.  Delivery
//! policy: five attempts with linear backoff on transport failures and on
//! 502-504; every other non-200 status is a permanent input error.

use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::{Backend, BackendError, FrameStream, StreamFrame};
use crate::config::Config;
use crate::task::{DocsRequest, InferRequest, InferResponse};

const SEND_ATTEMPTS: usize = 5;
const DOCS_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KserveBackend {
    client: reqwest::Client,
    address: String,
    custom_domain: String,
    namespace: String,
    version: String,
    timeout: Duration,
}

impl KserveBackend {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: config.kserve_address.clone(),
            custom_domain: config.kserve_custom_domain.clone(),
            namespace: config.kserve_namespace.clone(),
            version: config.kserve_version.clone(),
            timeout: Duration::from_secs(config.kserve_request_timeout),
        }
    }

    fn host_header(&self, model_name: &str) -> String {
        format!("{}.{}.{}", model_name, self.namespace, self.custom_domain)
    }

    fn request(
        &self,
        model_name: &str,
        method: reqwest::Method,
        url: &str,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header("Content-Type", "application/json")
            .header("Host", self.host_header(model_name))
            .timeout(timeout);
        if let Some(body) = body {
            req = req.body(body.to_vec());
        }
        req
    }

    /// Send with bounded linear-backoff retry on transport failures and
    /// 502-504; a non-200 status outside that band is final.
    async fn send_request(
        &self,
        model_name: &str,
        method: reqwest::Method,
        url: &str,
        body: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<reqwest::Response, BackendError> {
        for attempt in 0..SEND_ATTEMPTS {
            let req = self.request(model_name, method.clone(), url, body, timeout);
            let res = match req.send().await {
                Ok(res) => res,
                Err(e) => {
                    if attempt < SEND_ATTEMPTS - 1 {
                        warn!(model_name, error = %e, retry = attempt + 1, "failed to send request");
                        tokio::time::sleep(Duration::from_secs((attempt as u64 + 1) * 2)).await;
                        continue;
                    }
                    return Err(BackendError::SendRequest(format!(
                        "model-name: {model_name}, failed to send request: {e}"
                    )));
                }
            };

            let status = res.status().as_u16();
            if status == 200 {
                return Ok(res);
            }
            if (502..=504).contains(&status) && attempt < SEND_ATTEMPTS - 1 {
                warn!(model_name, status, retry = attempt + 1, "gateway status, retrying");
                tokio::time::sleep(Duration::from_secs((attempt as u64 + 1) * 2)).await;
                continue;
            }
            let message = res.text().await.unwrap_or_default();
            return Err(BackendError::InvalidInput(format!(
                "model-name: {model_name}, status-code: {status}, error: {message}, retries: {attempt}"
            )));
        }
        Err(BackendError::Internal("retry budget exhausted".to_owned()))
    }

    async fn predict_v1(&self, request: &InferRequest) -> Result<InferResponse, BackendError> {
        let data = serde_json::to_vec(&request.inputs).map_err(|_| BackendError::Marshal)?;
        let url = format!(
            "http://{}/v1/models/{}:predict",
            self.address, request.model_name
        );
        let res = self
            .send_request(
                &request.model_name,
                reqwest::Method::POST,
                &url,
                Some(&data),
                self.timeout,
            )
            .await?;

        let body = res
            .bytes()
            .await
            .map_err(|e| BackendError::ReadResponse(e.to_string()))?;
        let outputs = serde_json::from_slice(&body)
            .map_err(|e| BackendError::UnmarshalResponse(e.to_string()))?;
        Ok(InferResponse { outputs })
    }

    async fn generate_v1(&self, request: &InferRequest) -> Result<FrameStream, BackendError> {
        let data = serde_json::to_vec(&request.inputs).map_err(|_| BackendError::Marshal)?;
        // KServe renamed the streaming verb after 0.10.2.
        let verb = if self.version.as_str() <= "0.10.2" {
            "generate"
        } else {
            "predict"
        };
        let url = format!(
            "http://{}/v1/models/{}:{verb}",
            self.address, request.model_name
        );

        let res = self
            .request(
                &request.model_name,
                reqwest::Method::POST,
                &url,
                Some(&data),
                self.timeout,
            )
            .send()
            .await
            .map_err(|e| {
                BackendError::SendRequest(format!(
                    "model-name: {}, failed to send request: {e}",
                    request.model_name
                ))
            })?;
        if !res.status().is_success() {
            return Err(BackendError::InvalidInput(format!(
                "model-name: {}, status-code: {}",
                request.model_name,
                res.status().as_u16()
            )));
        }

        // Forward newline-delimited JSON frames as they arrive.  The reader
        // task ends as soon as the caller drops the stream; there is no
        // partial-message replay.
        let (tx, rx) = mpsc::channel::<Result<StreamFrame, BackendError>>(16);
        let model_name = request.model_name.clone();
        tokio::spawn(async move {
            let mut body = res.bytes_stream();
            let mut buffer = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx
                            .send(Err(BackendError::ReadResponse(e.to_string())))
                            .await;
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = &line[..line.len() - 1];
                    if line.is_empty() {
                        continue;
                    }
                    let frame = serde_json::from_slice::<StreamFrame>(line)
                        .map_err(|e| BackendError::UnmarshalResponse(e.to_string()));
                    if tx.send(frame).await.is_err() {
                        info!(model_name, "client stopped listening");
                        return;
                    }
                }
            }
            // Trailing frame without a final newline.
            if !buffer.is_empty() {
                let frame = serde_json::from_slice::<StreamFrame>(&buffer)
                    .map_err(|e| BackendError::UnmarshalResponse(e.to_string()));
                let _ = tx.send(frame).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[async_trait::async_trait]
impl Backend for KserveBackend {
    async fn predict(
        &self,
        request: &InferRequest,
        api_version: &str,
    ) -> Result<InferResponse, BackendError> {
        match api_version {
            "v1" => self.predict_v1(request).await,
            other => Err(BackendError::UnknownApiVersion(other.to_owned())),
        }
    }

    async fn generate(
        &self,
        request: &InferRequest,
        api_version: &str,
    ) -> Result<FrameStream, BackendError> {
        match api_version {
            "v1" => self.generate_v1(request).await,
            other => Err(BackendError::UnknownApiVersion(other.to_owned())),
        }
    }

    async fn docs(&self, request: &DocsRequest) -> Result<Value, BackendError> {
        let url = format!("http://{}/v1/docs/{}", self.address, request.model_name);
        let res = self
            .send_request(
                &request.model_name,
                reqwest::Method::GET,
                &url,
                None,
                DOCS_TIMEOUT,
            )
            .await?;
        let body = res
            .bytes()
            .await
            .map_err(|e| BackendError::ReadResponse(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| BackendError::UnmarshalResponse(e.to_string()))
    }
}
