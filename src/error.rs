//! Error types for the gateway and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Errors raised by the registry, port allocator and supervisor
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("route prefix '{prefix}' conflicts with existing route '{existing}'")]
    RouteConflict { prefix: String, existing: String },

    #[error("no free port in range {start}..={end}")]
    PortAllocation { start: u16, end: u16 },

    #[error("backend for '{prefix}' did not accept connections on port {port} within {timeout:?}")]
    ProcessStartupTimeout {
        prefix: String,
        port: u16,
        timeout: Duration,
    },

    #[error("backend for '{prefix}' exited during startup ({status})")]
    ProcessExited { prefix: String, status: String },

    #[error("backend for '{prefix}' crashed: {reason}")]
    ProcessCrash { prefix: String, reason: String },

    #[error("backend for '{prefix}' on port {port} is unreachable: {reason}")]
    BackendUnreachable {
        prefix: String,
        port: u16,
        reason: String,
    },

    #[error("authentication required")]
    Authentication,

    #[error("failed to spawn backend for '{prefix}': {reason}")]
    Spawn { prefix: String, reason: String },

    #[error("unknown route: {0}")]
    UnknownRoute(String),

    #[error("gateway is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Path is outside the mount path
    NotFound,
    /// No route matches the request path
    RouteNotFound,
    /// Credentials missing or invalid
    AuthenticationRequired,
    /// Backend exists but is not healthy
    BackendUnavailable,
    /// Backend was healthy but could not be reached
    BackendUnreachable,
    /// Backend refused the protocol upgrade
    UpgradeRejected,
    /// Route is at its concurrent client limit
    TooManyClients,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Gateway is shutting down
    ShuttingDown,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            ProxyErrorCode::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::BackendUnreachable => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::UpgradeRejected => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::TooManyClients => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            ProxyErrorCode::BackendUnavailable => "BACKEND_UNAVAILABLE",
            ProxyErrorCode::BackendUnreachable => "BACKEND_UNREACHABLE",
            ProxyErrorCode::UpgradeRejected => "UPGRADE_REJECTED",
            ProxyErrorCode::TooManyClients => "TOO_MANY_CLIENTS",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ShuttingDown => "SHUTTING_DOWN",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl From<&GatewayError> for ProxyErrorCode {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::UnknownRoute(_) => ProxyErrorCode::RouteNotFound,
            GatewayError::Authentication => ProxyErrorCode::AuthenticationRequired,
            GatewayError::ShuttingDown => ProxyErrorCode::ShuttingDown,
            GatewayError::BackendUnreachable { .. } => ProxyErrorCode::BackendUnreachable,
            GatewayError::ProcessStartupTimeout { .. }
            | GatewayError::ProcessExited { .. }
            | GatewayError::ProcessCrash { .. }
            | GatewayError::PortAllocation { .. }
            | GatewayError::Spawn { .. } => ProxyErrorCode::BackendUnavailable,
            GatewayError::RouteConflict { .. } | GatewayError::Config(_) => {
                ProxyErrorCode::InternalError
            }
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
