//! Error types and handling for the idempotency middleware.
//!
//! Every way a duplicate-aware request can be rejected has its own [`ErrorKind`],
//! a stable error code and a 4xx status so API consumers can branch on it.
//! All errors implement `IntoResponse` and serialize to JSON.
//!
//! # Design
//!
//! This module uses an opaque `Error` struct paired with an `ErrorKind` enum,
//! following the `std::io::Error` pattern. Internal error sources can change
//! without breaking consumers.
//!
//! # Example
//!
//! ```rust
//! use axum_idempotency::{Error, ErrorKind};
//! use axum::http::StatusCode;
//!
//! let error = Error::duplicate_request("Duplicate request detected.");
//!
//! match error.kind() {
//!     ErrorKind::DuplicateRequest => println!("already processed: {}", error),
//!     ErrorKind::LockWaitExceeded => println!("still processing, retry later"),
//!     _ => println!("other error: {}", error),
//! }
//!
//! assert_eq!(error.status_code(), StatusCode::CONFLICT);
//! assert_eq!(error.error_code(), "DUPLICATE_REQUEST");
//! ```

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The kind of error that occurred.
///
/// This enum is marked `#[non_exhaustive]`, so new variants may be added
/// in future versions without breaking existing code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Unrecognized duplicate behaviour, enforced verb, header name or resolver.
    #[error("invalid configuration")]
    InvalidConfiguration,

    /// The idempotency header is required but was absent or empty.
    #[error("missing idempotency key")]
    MissingIdempotencyKey,

    /// The idempotency key was first used on a different path.
    #[error("mismatched path")]
    MismatchedPath,

    /// A duplicate was detected and the policy rejects duplicates.
    #[error("duplicate request")]
    DuplicateRequest,

    /// The original request did not complete within the lock wait budget.
    #[error("lock wait exceeded")]
    LockWaitExceeded,

    /// The cached payload is neither a canonical entry nor a complete legacy map.
    #[error("corrupted cache data")]
    CorruptedCacheData,

    /// The cached payload is complete but holds an invalid value.
    #[error("invalid cached value")]
    InvalidCachedValue,

    /// The backing store failed.
    #[error("store error")]
    Store,

    /// I/O error while loading configuration.
    #[error("I/O error")]
    Io,

    /// Internal/unexpected error.
    #[error("internal error")]
    Internal,
}

/// An error raised by the idempotency middleware.
///
/// Use [`Error::kind()`] to determine the category of error for matching,
/// and the `Display` implementation to get a human-readable message.
///
/// ```rust
/// use axum_idempotency::{Error, ErrorKind};
///
/// let err = Error::missing_key("Idempotency key \"Idempotency-Key\" not found.");
/// assert_eq!(err.kind(), ErrorKind::MissingIdempotencyKey);
///
/// let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
/// let err = Error::new(ErrorKind::Io, io_err);
/// assert_eq!(err.kind(), ErrorKind::Io);
/// ```
pub struct Error {
    kind: ErrorKind,
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
    details: Option<String>,
}

impl Error {
    /// Creates a new error with the given kind and source.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        Self {
            kind,
            source: error.into(),
            details: None,
        }
    }

    /// Attaches client-facing details, rendered as `details` in the JSON body.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Returns the details attached with [`Error::with_details`], if any.
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error code string for this error.
    ///
    /// This is a stable identifier suitable for client-side error handling.
    pub fn error_code(&self) -> &'static str {
        match self.kind {
            ErrorKind::InvalidConfiguration => "INVALID_CONFIGURATION",
            ErrorKind::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            ErrorKind::MismatchedPath => "MISMATCHED_PATH",
            ErrorKind::DuplicateRequest => "DUPLICATE_REQUEST",
            ErrorKind::LockWaitExceeded => "LOCK_WAIT_EXCEEDED",
            ErrorKind::CorruptedCacheData => "CORRUPTED_CACHE_DATA",
            ErrorKind::InvalidCachedValue => "INVALID_CACHED_VALUE",
            ErrorKind::Store => "STORE_ERROR",
            ErrorKind::Io => "IO_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::InvalidConfiguration => StatusCode::BAD_REQUEST,
            ErrorKind::MissingIdempotencyKey => StatusCode::BAD_REQUEST,
            ErrorKind::MismatchedPath => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::DuplicateRequest => StatusCode::CONFLICT,
            ErrorKind::LockWaitExceeded => StatusCode::CONFLICT,
            ErrorKind::CorruptedCacheData => StatusCode::BAD_REQUEST,
            ErrorKind::InvalidCachedValue => StatusCode::BAD_REQUEST,
            ErrorKind::Store => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Io => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Converts the error into a structured error response.
    pub fn to_error_response(&self) -> ErrorResponse {
        let response = ErrorResponse::new(self.error_code(), self.to_string());
        match &self.details {
            Some(details) => response.with_details(details.clone()),
            None => response,
        }
    }

    /// Consumes the error and returns the inner error source.
    pub fn into_inner(self) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self.source
    }
}

// ============================================================================
// Convenience constructors
// ============================================================================

impl Error {
    /// Creates an invalid configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidConfiguration, msg.into())
    }

    /// Creates a missing idempotency key error.
    pub fn missing_key(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::MissingIdempotencyKey, msg.into())
    }

    /// Creates a mismatched path error.
    pub fn mismatched_path(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::MismatchedPath, msg.into())
    }

    /// Creates a duplicate request error.
    pub fn duplicate_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::DuplicateRequest, msg.into())
    }

    /// Creates a lock wait exceeded error.
    pub fn lock_wait_exceeded(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LockWaitExceeded, msg.into())
    }

    /// Creates a corrupted cache data error.
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::CorruptedCacheData, msg.into())
    }

    /// Creates an invalid cached value error.
    pub fn invalid_value(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCachedValue, msg.into())
    }

    /// Creates a store error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Store, msg.into())
    }

    /// Creates an I/O error from a message.
    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg.into())
    }

    /// Creates an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg.into())
    }
}

// ============================================================================
// Trait implementations
// ============================================================================

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("details", &self.details)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.source)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_response = self.to_error_response();

        if status.is_server_error() {
            tracing::error!(
                error_code = %error_response.error_code,
                message = %error_response.message,
                status = %status.as_u16(),
                "Idempotency middleware failed"
            );
        } else {
            tracing::warn!(
                error_code = %error_response.error_code,
                message = %error_response.message,
                status = %status.as_u16(),
                "Request rejected by idempotency middleware"
            );
        }

        (status, Json(error_response)).into_response()
    }
}

// ============================================================================
// From implementations
// ============================================================================

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::new(ErrorKind::InvalidConfiguration, err)
    }
}

impl From<std::env::VarError> for Error {
    fn from(err: std::env::VarError) -> Self {
        Self::new(ErrorKind::InvalidConfiguration, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::CorruptedCacheData, err)
    }
}

// ============================================================================
// ErrorResponse
// ============================================================================

/// Structured error response with error code and details.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Unique error code for client-side error handling.
    pub error_code: String,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details about the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Creates a new error response.
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Adds details to the error response.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
