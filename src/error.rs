//! Error handling and JSON error responses for the proxy

use crate::instance::InstanceId;
use crate::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route for the requested id, or endpoint not exposed
    RouteNotFound,
    /// Malformed request that cannot be forwarded
    InvalidRequest,
    /// Target did not answer in time
    UpstreamTimeout,
    /// Could not connect to, or talk with, the target
    UpstreamUnavailable,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ProxyErrorCode::InvalidRequest => "INVALID_REQUEST",
            ProxyErrorCode::UpstreamTimeout => "UPSTREAM_TIMEOUT",
            ProxyErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Failure of a single proxied request
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("no route for '{route_id}'")]
    RouteNotFound { route_id: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("instance {instance_id} did not respond within {timeout:?}")]
    UpstreamTimeout {
        instance_id: InstanceId,
        timeout: Duration,
    },

    #[error("instance {instance_id} unavailable: {reason}")]
    UpstreamUnavailable {
        instance_id: InstanceId,
        reason: String,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProxyError::RouteNotFound { .. } => ProxyErrorCode::RouteNotFound,
            ProxyError::InvalidRequest(_) => ProxyErrorCode::InvalidRequest,
            ProxyError::UpstreamTimeout { .. } => ProxyErrorCode::UpstreamTimeout,
            ProxyError::UpstreamUnavailable { .. } => ProxyErrorCode::UpstreamUnavailable,
            ProxyError::Internal(_) => ProxyErrorCode::InternalError,
        }
    }

    pub fn instance_id(&self) -> Option<&InstanceId> {
        match self {
            ProxyError::UpstreamTimeout { instance_id, .. }
            | ProxyError::UpstreamUnavailable { instance_id, .. } => Some(instance_id),
            _ => None,
        }
    }

    /// Public message; upstream details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ProxyError::RouteNotFound { .. } => "Unknown route or endpoint".to_string(),
            ProxyError::InvalidRequest(msg) => msg.clone(),
            ProxyError::UpstreamTimeout { timeout, .. } => {
                format!("Instance did not respond within {} seconds", timeout.as_secs())
            }
            ProxyError::UpstreamUnavailable { .. } => "Failed to connect to instance".to_string(),
            ProxyError::Internal(_) => "Internal proxy error".to_string(),
        }
    }

    pub fn into_response(self) -> Response<ProxyBody> {
        let mut error = ErrorResponse::new(self.code(), self.public_message());
        error.instance_id = self.instance_id().map(ToString::to_string);
        error.into_response()
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
    /// Instance the failed request was routed to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
            instance_id: None,
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

    fn into_response(self) -> Response<ProxyBody> {
        let status = self.code.status_code();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .header("X-Proxy-Error", self.code.as_header_value())
            .body(Full::new(Bytes::from(self.to_json())).map_err(|e| match e {}).boxed())
            .expect("valid response with StatusCode enum and static headers")
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    ErrorResponse::new(code, message).into_response()
}
