//! Backend error taxonomy.
//!
//! Adapters classify every failure into one of these kinds; the host maps
//! them to HTTP status codes and the processor treats all of them as
//! permanent task failures (the queue's own retry never re-runs a
//! prediction that the backend itself rejected).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to marshal request")]
    Marshal,

    #[error("failed to build request")]
    BuildRequest,

    #[error("failed to send request: {0}")]
    SendRequest(String),

    #[error("failed to read response body: {0}")]
    ReadResponse(String),

    #[error("failed to unmarshal response body: {0}")]
    UnmarshalResponse(String),

    #[error("API version {0} is not supported")]
    UnknownApiVersion(String),

    #[error("invalid inputs: {0}")]
    InvalidInput(String),

    #[error("backend internal error: {0}")]
    Internal(String),

    #[error("prediction timed out after {0} seconds")]
    Timeout(u64),
}

impl BackendError {
    /// `true` for errors the caller caused (bad payload, wrong version);
    /// the host surfaces these as 4xx.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            BackendError::Marshal
                | BackendError::BuildRequest
                | BackendError::InvalidInput(_)
                | BackendError::UnknownApiVersion(_)
        )
    }
}
