//! Unified service error model and HTTP mapping.
//! One enum covers the three failure kinds every operation can surface:
//! configuration problems, request validation problems, and wrapped
//! table-store failures. Handlers return it directly; the `IntoResponse`
//! impl renders the `{"error": ...}` envelope with the mapped status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Missing or unresolvable process configuration (e.g. no project id).
    Config { message: String },
    /// Bad request input: malformed table reference, unknown column,
    /// empty month selection, unusable upload.
    Validation { message: String },
    /// Any failure reported by the table store, wrapped with the table and
    /// operation it occurred in. Never retried.
    Store { message: String },
}

impl ServiceError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ServiceError::Config { message: msg.into() }
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        ServiceError::Validation { message: msg.into() }
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        ServiceError::Store { message: msg.into() }
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::Config { message }
            | ServiceError::Validation { message }
            | ServiceError::Store { message } => message.as_str(),
        }
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            ServiceError::Config { .. } => "config",
            ServiceError::Validation { .. } => "validation",
            ServiceError::Store { .. } => "store",
        }
    }

    /// Map to HTTP status code: validation is the caller's fault, the rest
    /// are server-side.
    pub fn http_status(&self) -> StatusCode {
        match self {
            ServiceError::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Validation { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind_str(), self.message())
    }
}

impl std::error::Error for ServiceError {}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        if status.is_server_error() {
            tracing::error!(kind = self.kind_str(), "{}", self.message());
        }
        (status, Json(serde_json::json!({ "error": self.message() }))).into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
