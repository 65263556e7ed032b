//! Task data model shared by the gateway, the processor and the
//! reconciliation engine.
//!
//! A task's record in the external store is the single source of truth for
//! callers; the work queue is only an ephemeral dispatch mechanism.  The
//! types here mirror the record store's wire format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle status of a task record.
///
/// Transitions are monotonic in practice (`pending`/`running` → terminal),
/// but the record store itself does not enforce this; callers mutating a
/// record must check [`TaskStatus::is_terminal`] before overwriting.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// `true` once no automated process may write a different status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

/// A single inference request, opaque to the core beyond the model name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
    pub model_name: String,
    pub inputs: Map<String, Value>,
}

/// Outputs of a successful backend invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferResponse {
    pub outputs: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocsRequest {
    pub model_name: String,
}

/// The record store's view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub running_time: String,
    #[serde(default)]
    pub outputs: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub error_info: String,
    #[serde(default)]
    pub queue_id: String,
}

/// A single mutation sent to the record store.
///
/// Unset fields are left untouched by the store.  `database_only` bypasses
/// any queue bookkeeping on the store side and is used by the stale-status
/// sweep when the queue must not be consulted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_info: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not", default)]
    pub database_only: bool,
}

impl TaskUpdate {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn running_time(mut self, running_time: impl Into<String>) -> Self {
        self.running_time = Some(running_time.into());
        self
    }

    pub fn outputs(mut self, outputs: Value) -> Self {
        self.outputs = Some(outputs);
        self
    }

    pub fn error_info(mut self, info: impl Into<String>) -> Self {
        self.error_info = Some(info.into());
        self
    }

    pub fn queue_id(mut self, queue_id: impl Into<String>) -> Self {
        self.queue_id = Some(queue_id.into());
        self
    }

    pub fn database_only(mut self) -> Self {
        self.database_only = true;
        self
    }
}

fn default_api_version() -> String {
    "v1".to_owned()
}

/// What gets serialized into a durable queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionPayload {
    #[serde(flatten)]
    pub request: InferRequest,
    pub id: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

/// Backend-reported execution duration, extracted from a success payload.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningTime {
    /// Verbatim display form, e.g. `"1.52s"`; stored on the task record.
    pub display: String,
    /// Parsed seconds, when the display form is a `"<float>s"` value.
    pub seconds: Option<f64>,
}

/// Remove the `running_time` field from a success payload and parse it.
///
/// The value is stripped from `outputs` so the stored payload never carries
/// it twice; `None` when the backend did not report a duration.
pub fn extract_running_time(outputs: &mut Map<String, Value>) -> Option<RunningTime> {
    let raw = outputs.remove("running_time")?;
    let display = match raw {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let seconds = display.replace('s', "").parse::<f64>().ok();
    Some(RunningTime { display, seconds })
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_wire_form_is_lowercase() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(TaskStatus::Canceled.to_string(), "canceled");
        assert_eq!("failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Canceled.is_terminal());
    }

    #[test]
    fn payload_round_trips_with_flattened_request() {
        let payload = PredictionPayload {
            request: InferRequest {
                model_name: "llama".to_owned(),
                inputs: Map::new(),
            },
            id: "abc".to_owned(),
            api_version: "v1".to_owned(),
        };
        let raw = serde_json::to_string(&payload).unwrap();
        let back: PredictionPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.id, "abc");
        assert_eq!(back.request.model_name, "llama");
    }

    #[test]
    fn payload_api_version_defaults_to_v1() {
        let back: PredictionPayload =
            serde_json::from_value(json!({ "model_name": "m", "inputs": {}, "id": "x" }))
                .unwrap();
        assert_eq!(back.api_version, "v1");
    }

    #[test]
    fn running_time_is_extracted_and_removed() {
        let mut outputs = Map::new();
        outputs.insert("output".to_owned(), json!("hi"));
        outputs.insert("running_time".to_owned(), json!("1.5s"));

        let rt = extract_running_time(&mut outputs).unwrap();
        assert_eq!(rt.display, "1.5s");
        assert_eq!(rt.seconds, Some(1.5));
        assert!(!outputs.contains_key("running_time"));
        assert!(outputs.contains_key("output"));
    }

    #[test]
    fn running_time_absent_leaves_outputs_alone() {
        let mut outputs = Map::new();
        outputs.insert("output".to_owned(), json!("hi"));
        assert!(extract_running_time(&mut outputs).is_none());
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn update_skips_unset_fields_on_the_wire() {
        let update = TaskUpdate::new("t1").status(TaskStatus::Running);
        let raw = serde_json::to_value(&update).unwrap();
        assert_eq!(raw, json!({ "id": "t1", "status": "running" }));
    }
}
