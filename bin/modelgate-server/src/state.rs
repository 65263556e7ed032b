//! Shared application state injected into every Axum handler.

use modelgate_core::gateway::Gateway;
use modelgate_core::TaskDistributor;

/// State shared across all HTTP handlers.
pub struct AppState {
    /// Request-facing orchestration over queue, record store and backend.
    pub gateway: Gateway,
    /// Direct queue control for the admin surface (pause, listings).
    pub distributor: TaskDistributor,
}
