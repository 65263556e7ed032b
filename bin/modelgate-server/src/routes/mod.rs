//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - Liveness / readiness probes
//! - Synchronous `/v1` inference routes
//! - Asynchronous task submission and queue control at the root

mod health;
mod tasks;
mod v1;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

// ── Router builder ────────────────────────────────────────────────────────────

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(tasks::router())
        .nest("/v1", v1::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
