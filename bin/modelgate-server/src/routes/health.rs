//! Liveness / readiness endpoints.

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/live", get(liveness))
        .route("/ready", get(readiness))
}

/// Heartbeat endpoint; load-balancers and monitoring systems poll this.
pub async fn liveness() -> Json<Value> {
    Json(json!({ "message": "API OK" }))
}

/// Readiness endpoint.  Queue pressure is surfaced via `/v1/queue_size`
/// and the admission check, not here.
pub async fn readiness() -> Json<Value> {
    Json(json!({ "message": "API OK" }))
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn liveness_reports_ok() {
        let Json(body) = liveness().await;
        assert_eq!(body["message"], "API OK");
    }
}
