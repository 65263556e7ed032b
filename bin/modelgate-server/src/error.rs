//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.
//!
//! Backend errors keep the original status mapping: input-shaped failures
//! are the caller's fault (400), an unreachable model is 403, a full queue
//! is 429, and everything else is an internal error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use modelgate_core::backend::BackendError;
use modelgate_core::gateway::GatewayError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

/// All errors that can occur in the modelgate-server request lifecycle.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from a gateway flow (queue, record store or backend).
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// A queue control operation was refused.
    #[error("forbidden: {0}")]
    Forbidden(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::Gateway(e) => gateway_status(e),
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Cancellation refuses with 403 when the queue will not give the entry
/// up (already claimed or the queue itself errored); other failures keep
/// the regular mapping.
pub(crate) fn cancel_error(error: GatewayError) -> ServerError {
    match error {
        GatewayError::Queue(e) => ServerError::Forbidden(e.to_string()),
        other => ServerError::Gateway(other),
    }
}

fn gateway_status(error: &GatewayError) -> StatusCode {
    match error {
        GatewayError::QueueFull => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::Backend(e) if e.is_input_error() => StatusCode::BAD_REQUEST,
        GatewayError::Backend(BackendError::SendRequest(_)) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use modelgate_core::queue::QueueError;

    #[test]
    fn queue_full_maps_to_429() {
        assert_eq!(
            gateway_status(&GatewayError::QueueFull),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn input_errors_map_to_400() {
        let e = GatewayError::Backend(BackendError::InvalidInput("x".to_owned()));
        assert_eq!(gateway_status(&e), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn unreachable_model_maps_to_403() {
        let e = GatewayError::Backend(BackendError::SendRequest("x".to_owned()));
        assert_eq!(gateway_status(&e), StatusCode::FORBIDDEN);
    }

    #[test]
    fn everything_else_maps_to_500() {
        let e = GatewayError::Backend(BackendError::Internal("x".to_owned()));
        assert_eq!(gateway_status(&e), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn cancel_refused_by_the_queue_maps_to_403() {
        let e = GatewayError::Queue(QueueError::Backend("held".to_owned()));
        assert_eq!(
            cancel_error(e).into_response().status(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn cancel_keeps_the_regular_mapping_for_other_failures() {
        let e = GatewayError::Backend(BackendError::Internal("x".to_owned()));
        assert_eq!(
            cancel_error(e).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
