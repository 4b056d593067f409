//! Gateway error taxonomy and HTTP error responses.
//!
//! Every failure that crosses the HTTP boundary is expressed as a
//! [`GatewayError`] with a stable machine-readable kind. Responses are
//! JSON `{kind, message, retry_after_ms?}` and never leak stack traces
//! or internal identifiers. Internally, fallible paths use
//! `anyhow::Result` and convert at the boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// Machine-readable error kind, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    RateLimited,
    UpstreamUnavailable,
    AnalysisFailed,
    StorageFailed,
    SessionNotFound,
    PrivacyBlock,
    Timeout,
    Internal,
}

impl ErrorKind {
    /// HTTP status code this kind maps to.
    pub fn status(self) -> StatusCode {
        match self {
            Self::BadRequest => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            Self::AnalysisFailed => StatusCode::BAD_GATEWAY,
            Self::StorageFailed => StatusCode::INTERNAL_SERVER_ERROR,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::PrivacyBlock => StatusCode::FORBIDDEN,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::AnalysisFailed => "analysis_failed",
            Self::StorageFailed => "storage_failed",
            Self::SessionNotFound => "session_not_found",
            Self::PrivacyBlock => "privacy_block",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }
}

/// An error surfaced to an HTTP caller.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self {
            kind: ErrorKind::RateLimited,
            message: "too many requests".into(),
            retry_after_ms: Some(retry_after_ms),
        }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamUnavailable, message)
    }

    pub fn analysis_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AnalysisFailed, message)
    }

    pub fn storage_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StorageFailed, message)
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(ErrorKind::SessionNotFound, format!("unknown session: {id}"))
    }

    pub fn privacy_block(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PrivacyBlock, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal() -> Self {
        // Deliberately generic: internals go to the log, not the wire.
        Self::new(ErrorKind::Internal, "internal error")
    }

    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.kind.status(), Json(self)).into_response()
    }
}

/// Convert an internal error into a wire error, logging the detail and
/// surfacing only the generic message.
pub fn internal_from(err: &anyhow::Error) -> GatewayError {
    tracing::error!(error = %err, "internal error");
    GatewayError::internal()
}
