// HTTP error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for HTTP handlers
pub type AppResult<T> = Result<T, AppError>;

/// Application error with HTTP status code
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for AppError {}

/// Error response JSON structure
#[derive(Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
    status: u16,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            error: self.message,
            status: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Convert engine errors to HTTP errors
impl From<shopstream_core::Error> for AppError {
    fn from(err: shopstream_core::Error) -> Self {
        use shopstream_core::Error;

        match err {
            Error::Validation(msg) | Error::Negotiation(msg) => Self::bad_request(msg),
            Error::NotFound { .. } => Self::not_found(err.to_string()),
            Error::InvalidState(msg) => Self::conflict(msg),
            Error::Unauthorized(msg) => Self::unauthorized(msg),
            Error::WorkerFailure(msg) => {
                tracing::error!("Worker failure surfaced over HTTP: {msg}");
                Self::internal_server_error("Media worker unavailable")
            }
            Error::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                Self::internal_server_error("Internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shopstream_core::Error;

    #[test]
    fn test_engine_error_mapping() {
        assert_eq!(
            AppError::from(Error::not_found("room", "R1")).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(Error::InvalidState("x".into())).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(Error::Unauthorized("x".into())).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::from(Error::Validation("x".into())).status,
            StatusCode::BAD_REQUEST
        );
    }
}
