//! Error taxonomy and JSON error responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header carrying the machine-checkable error kind
pub const X_PREVIEW_ERROR: &str = "x-preview-error";

/// Machine-checkable error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed request body or invalid instance name
    BadRequest,
    /// Unknown project, instance or route
    NotFound,
    /// The dev-server command is missing or unconfigured
    ToolchainUnavailable,
    /// The child process could not be created
    SpawnFailure,
    /// The child reported an error after starting
    RuntimeFailure,
    /// The child is not accepting connections on its port
    ProxyUnreachable,
    /// The child did not answer a proxied request in time
    RequestTimeout,
    /// Anything else
    InternalError,
}

impl ErrorKind {
    /// Get the default HTTP status code for this kind
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::ToolchainUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::SpawnFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::RuntimeFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ProxyUnreachable => StatusCode::BAD_GATEWAY,
            ErrorKind::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the kind as a string for the X-Preview-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorKind::BadRequest => "BAD_REQUEST",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::ToolchainUnavailable => "TOOLCHAIN_UNAVAILABLE",
            ErrorKind::SpawnFailure => "SPAWN_FAILURE",
            ErrorKind::RuntimeFailure => "RUNTIME_FAILURE",
            ErrorKind::ProxyUnreachable => "PROXY_UNREACHABLE",
            ErrorKind::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorKind::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Failures of control operations (run/stop/status)
#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("invalid instance name '{0}': use 1-64 characters of [A-Za-z0-9_-]")]
    InvalidName(String),

    #[error("unknown project '{0}'")]
    NotFound(String),

    #[error("dev-server command '{command}' is not available: {reason}")]
    ToolchainUnavailable { command: String, reason: String },

    #[error("failed to spawn dev server for '{name}': {source}")]
    SpawnFailure {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no free port at or above {start}")]
    AllocationFailure { start: u16 },
}

impl PreviewError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PreviewError::InvalidName(_) => ErrorKind::BadRequest,
            PreviewError::NotFound(_) => ErrorKind::NotFound,
            PreviewError::ToolchainUnavailable { .. } => ErrorKind::ToolchainUnavailable,
            PreviewError::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            PreviewError::AllocationFailure { .. } => ErrorKind::InternalError,
        }
    }

    /// Render as a JSON error response
    pub fn to_response(&self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.kind(), self.to_string())
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error kind
    pub code: ErrorKind,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with the X-Preview-Error header
pub fn json_error_response(
    code: ErrorKind,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .header(X_PREVIEW_ERROR, code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
