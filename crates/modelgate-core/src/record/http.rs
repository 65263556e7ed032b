//! HTTP record-store client.
//!
//! Talks to the task-record service at `http://{addr}/task` with a fixed
//! request timeout and a bounded retry budget.  Retries cover transport
//! failures only; a decoded non-200 status is final.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use super::{RecordError, RecordStore};
use crate::config::Config;
use crate::task::{TaskInfo, TaskStatus, TaskUpdate};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_ATTEMPTS: usize = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpRecordStore {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: format!("http://{}/task", config.record_store_address),
            api_key: config.record_store_api_key.clone(),
        }
    }

    /// Send a request, retrying transport failures with a fixed delay.
    async fn send_with_retry(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, RecordError> {
        let mut last_err = None;
        for attempt in 1..=RETRY_ATTEMPTS {
            let req = request
                .try_clone()
                .ok_or_else(|| RecordError::Send("request is not retryable".to_owned()))?;
            match req.send().await {
                Ok(res) => return Ok(res),
                Err(e) => {
                    warn!(attempt, error = %e, "record-store request failed, retrying");
                    last_err = Some(e);
                }
            }
            if attempt < RETRY_ATTEMPTS {
                tokio::time::sleep(RETRY_DELAY).await;
            }
        }
        Err(RecordError::Send(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }
}

async fn status_error(res: reqwest::Response) -> RecordError {
    let code = res.status().as_u16();
    let message = res.text().await.unwrap_or_default();
    RecordError::Status { code, message }
}

#[async_trait::async_trait]
impl RecordStore for HttpRecordStore {
    async fn create_task(
        &self,
        id: &str,
        user_id: &str,
        model_name: &str,
        status: Option<TaskStatus>,
        queue_position: usize,
    ) -> Result<Value, RecordError> {
        let mut info = json!({
            "id": id,
            "model_name": model_name,
            "queue_num": queue_position,
        });
        if let Some(status) = status {
            info["status"] = json!(status);
        }

        let req = self
            .client
            .post(&self.base_url)
            .header("apikey", &self.api_key)
            .header("UID", user_id)
            .json(&info);
        let res = self.send_with_retry(req).await?;
        if !res.status().is_success() {
            return Err(status_error(res).await);
        }
        res.json::<Value>()
            .await
            .map_err(|e| RecordError::Decode(e.to_string()))
    }

    async fn update_task(&self, update: &TaskUpdate) -> Result<(), RecordError> {
        let req = self
            .client
            .put(&self.base_url)
            .header("apikey", &self.api_key)
            .json(update);
        let res = self.send_with_retry(req).await?;
        if !res.status().is_success() {
            return Err(status_error(res).await);
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Value, RecordError> {
        let url = format!("{}/{}", self.base_url, id);
        let req = self.client.get(&url).header("apikey", &self.api_key);
        let res = self.send_with_retry(req).await?;
        if !res.status().is_success() {
            return Err(status_error(res).await);
        }
        res.json::<Value>()
            .await
            .map_err(|e| RecordError::Decode(e.to_string()))
    }

    async fn get_task_typed(&self, id: &str) -> Result<TaskInfo, RecordError> {
        let raw = self.get_task(id).await?;
        serde_json::from_value(raw).map_err(|e| RecordError::Decode(e.to_string()))
    }

    async fn list_ids_by_model_status(
        &self,
        model_name: &str,
        status: TaskStatus,
    ) -> Result<Vec<String>, RecordError> {
        let url = format!("{}/modelstatus", self.base_url);
        let req = self
            .client
            .get(&url)
            .header("apikey", &self.api_key)
            .json(&json!({ "model_name": model_name, "status": status }));
        let res = self.send_with_retry(req).await?;

        // The store answers non-200 when the query matches nothing; that is
        // an empty result, not an operational failure.
        if !res.status().is_success() {
            warn!(
                model_name,
                %status,
                code = res.status().as_u16(),
                "no task records found by model status"
            );
            return Ok(Vec::new());
        }

        let rows: Vec<Value> = res
            .json()
            .await
            .map_err(|e| RecordError::Decode(e.to_string()))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get("task_id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect())
    }
}
