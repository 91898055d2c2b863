use http::StatusCode;
use serde::Serialize;
use std::fmt;

/// Stable machine-readable error codes exposed on the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    OriginUnavailable,
    InternalServerError,
}

impl ErrorCode {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::OriginUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn docs_url(self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "https://aegis.dev/docs/errors/bad-request",
            ErrorCode::Unauthorized => "https://aegis.dev/docs/errors/unauthorized",
            ErrorCode::Forbidden => "https://aegis.dev/docs/errors/forbidden",
            ErrorCode::NotFound => "https://aegis.dev/docs/errors/not-found",
            ErrorCode::OriginUnavailable => "https://aegis.dev/docs/errors/origin-unavailable",
            ErrorCode::InternalServerError => "https://aegis.dev/docs/errors/internal",
        }
    }
}

/// Typed error for the rate-limit hot path and its administrative surface.
///
/// Transient cluster conditions never surface directly: the coordinator
/// degrades to a local decision or returns `OriginUnavailable`. The hot
/// path never panics.
#[derive(Debug)]
pub enum GatewayError {
    /// Malformed or out-of-range request payload. Never retried.
    Validation(String),
    /// Missing or unparsable credentials.
    Unauthorized,
    /// Credentials are valid but lack the required permission.
    Forbidden(String),
    /// Namespace absent and the caller may not auto-create it.
    NamespaceNotFound(String),
    /// Override lookup missed.
    OverrideNotFound(String),
    /// Owner unreachable on the synchronous consistency path.
    OriginUnavailable(String),
    /// Primary store failure (namespace / override reads and writes).
    Store(String),
    /// Every cache tier failed for a lookup.
    Cache(String),
    /// Invariant violation or arithmetic anomaly. Logged with full context.
    Internal(String),
}

impl GatewayError {
    pub fn code(&self) -> ErrorCode {
        match self {
            GatewayError::Validation(_) => ErrorCode::BadRequest,
            GatewayError::Unauthorized => ErrorCode::Unauthorized,
            GatewayError::Forbidden(_) => ErrorCode::Forbidden,
            GatewayError::NamespaceNotFound(_) | GatewayError::OverrideNotFound(_) => {
                ErrorCode::NotFound
            }
            GatewayError::OriginUnavailable(_) => ErrorCode::OriginUnavailable,
            GatewayError::Store(_) | GatewayError::Cache(_) | GatewayError::Internal(_) => {
                ErrorCode::InternalServerError
            }
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Validation(msg) => write!(f, "invalid request: {}", msg),
            GatewayError::Unauthorized => write!(f, "missing or invalid credentials"),
            GatewayError::Forbidden(perm) => write!(f, "missing permission: {}", perm),
            GatewayError::NamespaceNotFound(name) => write!(f, "namespace not found: {}", name),
            GatewayError::OverrideNotFound(id) => write!(f, "override not found: {}", id),
            GatewayError::OriginUnavailable(node) => {
                write!(f, "origin node unavailable: {}", node)
            }
            GatewayError::Store(msg) => write!(f, "primary store error: {}", msg),
            GatewayError::Cache(msg) => write!(f, "cache error: {}", msg),
            GatewayError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Wire shape of every error reply: `{code, message, docs_url, request_id}`.
/// The success fields of the operation are omitted entirely.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub docs_url: &'static str,
    pub request_id: String,
}

impl ErrorBody {
    pub fn from_error(err: &GatewayError, request_id: &str) -> Self {
        let code = err.code();
        // Internal detail stays in the logs; callers get the category only.
        let message = match code {
            ErrorCode::InternalServerError => "internal server error".to_string(),
            _ => err.to_string(),
        };
        Self {
            code,
            message,
            docs_url: code.docs_url(),
            request_id: request_id.to_string(),
        }
    }
}
