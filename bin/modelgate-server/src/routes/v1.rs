//! Synchronous inference endpoints under `/v1`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use modelgate_core::task::{DocsRequest, InferRequest};
use serde_json::{json, Value};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/predict", post(predict))
        .route("/generate", post(generate))
        .route("/docs", get(docs))
        .route("/queue_size", get(queue_size))
}

/// Caller identity forwarded by the upstream proxy.
pub(crate) fn user_id(headers: &HeaderMap) -> &str {
    headers
        .get("UID")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

/// Run one prediction inline and return the stored terminal record.
async fn predict(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<InferRequest>,
) -> Result<Json<Value>, ServerError> {
    let record = state
        .gateway
        .predict(user_id(&headers), request, "v1")
        .await?;
    Ok(Json(record))
}

/// Stream generation frames to the caller as newline-delimited JSON.
async fn generate(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InferRequest>,
) -> Result<Response, ServerError> {
    let frames = state.gateway.generate(request, "v1").await?;
    let body = Body::from_stream(frames.map(|frame| {
        frame.map(|f| {
            let mut line = serde_json::to_vec(&f).unwrap_or_default();
            line.push(b'\n');
            bytes::Bytes::from(line)
        })
    }));
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(body)
        .map_err(|e| ServerError::BadRequest(e.to_string()))
}

async fn docs(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DocsRequest>,
) -> Result<Json<Value>, ServerError> {
    Ok(Json(state.gateway.docs(&request).await?))
}

async fn queue_size(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    let size = state.gateway.queue_size().await?;
    Ok(Json(json!({ "queue_size": size })))
}
