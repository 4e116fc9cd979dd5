//! Error types for relaygate.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::credentials::ResolveError;
use crate::proxy::normalize::{ErrorEnvelope, ErrorKind};
use crate::proxy::transport::TransportError;

/// Result type alias for relaygate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to clients, as a JSON response before a stream starts or
/// as an error frame inside one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Validation(String),

    #[error("Upstream returned {status}")]
    Upstream { status: u16, body: Value },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Upstream { status, body } => Error::Upstream { status, body },
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::NotFound(_) => Error::Authentication(e.to_string()),
            ResolveError::Store(store) => Error::Internal(store.to_string()),
        }
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Authentication(_) => StatusCode::UNAUTHORIZED,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Error::Config(_) | Error::Internal(_) | Error::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let code = self.status().as_u16();
        match self {
            Error::Authentication(message) => {
                ErrorEnvelope::new(ErrorKind::Authentication, message.clone(), code)
            }
            Error::Validation(message) => {
                ErrorEnvelope::new(ErrorKind::InvalidRequest, message.clone(), code)
            }
            Error::Upstream { body, .. } => ErrorEnvelope::from_upstream(code, body),
            // Internal details stay in the logs.
            Error::Config(_) | Error::Internal(_) | Error::Database(_) => {
                ErrorEnvelope::new(ErrorKind::Internal, "Internal server error", code)
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, axum::Json(self.envelope().to_value())).into_response()
    }
}
