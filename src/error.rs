//! Error types for the signal endpoint and the container runtime.

use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

/// Rejections produced while handling an inbound signal.
///
/// The response body is a fixed string per variant; the cause is only ever
/// logged, never sent back to the caller.
#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("unsupported method or malformed request")]
    BadRequest,
    #[error("missing or wrong shared secret")]
    Unauthorized,
    #[error("too many requests from this source")]
    RateLimited,
    #[error("failed to persist signal: {0}")]
    Storage(#[from] std::io::Error),
}

impl SignalError {
    pub fn status(&self) -> StatusCode {
        match self {
            SignalError::BadRequest => StatusCode::BAD_REQUEST,
            SignalError::Unauthorized => StatusCode::UNAUTHORIZED,
            SignalError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            SignalError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> &'static str {
        match self {
            SignalError::BadRequest => "400 Bad Request",
            SignalError::Unauthorized => "401 Unauthorized",
            SignalError::RateLimited => "429 Too Many Requests",
            SignalError::Storage(_) => "500 Internal Server Error",
        }
    }
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        (
            self.status(),
            [(header::CONTENT_TYPE, "text/plain")],
            self.body(),
        )
            .into_response()
    }
}

/// Failures of a single container runtime call.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("no such object: {0}")]
    NotFound(String),
    #[error("{op} failed: {reason}")]
    Unavailable { op: String, reason: String },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: String, after: Duration },
}

impl RuntimeError {
    pub fn unavailable(op: impl Into<String>, reason: impl ToString) -> Self {
        RuntimeError::Unavailable {
            op: op.into(),
            reason: reason.to_string(),
        }
    }
}
