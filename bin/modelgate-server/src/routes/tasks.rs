//! Asynchronous task endpoints: submission, inspection and queue control.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use modelgate_core::queue::QUEUE_CRITICAL;
use modelgate_core::task::InferRequest;
use serde_json::{json, Value};

use super::v1::user_id;
use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/async/v1/predict", post(submit))
        .route("/task/{id}", get(get_task))
        .route("/cancel/{id}", post(cancel))
        .route("/pause", post(pause))
        .route("/unpause", post(unpause))
        .route("/delete_pending", post(delete_pending))
        .route("/unfinished", get(unfinished))
}

/// Submit a prediction for background execution; returns the task id the
/// caller polls via `/task/{id}`.
async fn submit(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<InferRequest>,
) -> Result<Json<Value>, ServerError> {
    let id = state
        .gateway
        .submit_prediction(user_id(&headers), request, "v1")
        .await?;
    Ok(Json(json!({ "id": id })))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    Ok(Json(state.gateway.get_task(&id).await?))
}

async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ServerError> {
    state
        .gateway
        .cancel_task(&id)
        .await
        .map_err(crate::error::cancel_error)?;
    Ok(Json(json!({ "id": id })))
}

async fn pause(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    state
        .distributor
        .pause()
        .await
        .map_err(|e| ServerError::Forbidden(e.to_string()))?;
    Ok(Json(json!({ "info": format!("queue {QUEUE_CRITICAL} paused") })))
}

async fn unpause(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    state
        .distributor
        .unpause()
        .await
        .map_err(|e| ServerError::Forbidden(e.to_string()))?;
    Ok(Json(json!({ "info": format!("queue {QUEUE_CRITICAL} unpaused") })))
}

/// Drop the queue entries of every pending task record.  The records
/// themselves are left for the reconciliation sweep.
async fn delete_pending(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ServerError> {
    let outcome = state.gateway.delete_pending().await?;
    Ok(Json(serde_json::to_value(outcome).unwrap_or_default()))
}

async fn unfinished(State(state): State<Arc<AppState>>) -> Json<Value> {
    let entries = state.distributor.list_unfinished().await;
    Json(json!({ "num_of_unfinished_tasks": entries.len() }))
}
