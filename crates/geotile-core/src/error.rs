//! Error types shared by every layer of the SDK.
//!
//! Results travel through task callbacks, continuation steps and network
//! callbacks as [`ApiResponse`], which is a plain `Result` with [`ApiError`]
//! on the failure side.

use std::fmt;

/// Result type delivered to callbacks and returned by task bodies.
pub type ApiResponse<T> = std::result::Result<T, ApiError>;

/// Classification of an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The error could not be classified.
    Unknown,
    /// The operation was cancelled through its cancellation context.
    Cancelled,
    /// A bounded wait expired before the operation completed.
    RequestTimeout,
    /// The caller passed an invalid argument.
    InvalidArgument,
    /// The requested resource does not exist (404).
    NotFound,
    /// The request was malformed (400).
    BadRequest,
    /// The credentials were rejected (401).
    AuthorizationError,
    /// The caller is not allowed to access the resource (403).
    AccessDenied,
    /// A request precondition did not hold (412).
    PreconditionFailed,
    /// The service is temporarily unavailable (502, 503, 504).
    ServiceUnavailable,
    /// The service asked the client to back off (429).
    SlowDown,
    /// The service failed internally (500).
    InternalFailure,
    /// The connection could not be established.
    NetworkConnection,
}

impl ErrorCode {
    /// Map an HTTP status code to an error code.
    #[must_use]
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => Self::BadRequest,
            401 => Self::AuthorizationError,
            403 => Self::AccessDenied,
            404 => Self::NotFound,
            408 => Self::RequestTimeout,
            412 => Self::PreconditionFailed,
            429 => Self::SlowDown,
            500 => Self::InternalFailure,
            502..=504 => Self::ServiceUnavailable,
            _ => Self::Unknown,
        }
    }

    /// Human readable name used in error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Cancelled => "cancelled",
            Self::RequestTimeout => "request timeout",
            Self::InvalidArgument => "invalid argument",
            Self::NotFound => "not found",
            Self::BadRequest => "bad request",
            Self::AuthorizationError => "authorization error",
            Self::AccessDenied => "access denied",
            Self::PreconditionFailed => "precondition failed",
            Self::ServiceUnavailable => "service unavailable",
            Self::SlowDown => "slow down",
            Self::InternalFailure => "internal failure",
            Self::NetworkConnection => "network connection",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error delivered in place of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
    http_status: Option<u16>,
}

impl ApiError {
    /// Create an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            http_status: None,
        }
    }

    /// Create an error from an unsuccessful HTTP status.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::from_http_status(status),
            message: message.into(),
            http_status: Some(status),
        }
    }

    /// The error delivered for cancelled operations.
    #[must_use]
    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "Cancelled")
    }

    /// The error delivered when a bounded wait expires.
    #[must_use]
    pub fn timeout() -> Self {
        Self::new(ErrorCode::RequestTimeout, "Request timed out")
    }

    /// The error code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// The error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The HTTP status that produced this error, if any.
    #[must_use]
    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// Whether this error reports a cancellation rather than a failure.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::Cancelled
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.http_status {
            Some(status) => write!(f, "{} (status {status}): {}", self.code, self.message),
            None => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for ApiError {}
