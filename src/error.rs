//! Error types for the PGP signing service
//!
//! Every failure that crosses the HTTP boundary is an [`AppError`] carrying
//! one of the closed set of [`ErrorCode`] variants. Handlers pattern-match on
//! the variant; nothing downstream string-matches messages.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use crate::server::request_id;

/// Result type alias for the signing service
pub type Result<T> = std::result::Result<T, AppError>;

/// Closed set of wire-visible error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No bearer token on a route that requires one
    AuthMissing,
    /// Token failed verification (signature, expiry, issuer, audience)
    AuthInvalid,
    /// Requested key id has no stored key
    KeyNotFound,
    /// Stored key material could not be parsed or its public half extracted
    KeyProcessingError,
    /// Key store listing failed
    KeyListError,
    /// Upload parse or persist failed
    KeyUploadError,
    /// Key store delete failed
    KeyDeleteError,
    /// Signing primitive or passphrase failure
    SignError,
    /// Rate limiter unreachable
    RateLimitError,
    /// Per-identity capacity exhausted
    RateLimited,
    /// Schema/shape/empty-body/param-range failure
    InvalidRequest,
    /// Audit query failed
    AuditError,
    /// Unknown route
    NotFound,
    /// Catch-all
    InternalError,
}

impl ErrorCode {
    /// The HTTP status this code maps to.
    #[must_use]
    pub fn status(self) -> StatusCode {
        match self {
            Self::AuthMissing | Self::AuthInvalid => StatusCode::UNAUTHORIZED,
            Self::KeyNotFound | Self::NotFound => StatusCode::NOT_FOUND,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::RateLimitError => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidRequest => StatusCode::BAD_REQUEST,
            Self::KeyProcessingError
            | Self::KeyListError
            | Self::KeyUploadError
            | Self::KeyDeleteError
            | Self::SignError
            | Self::AuditError
            | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Generic message used when no upstream cause is available.
    #[must_use]
    pub fn generic_message(self) -> &'static str {
        match self {
            Self::AuthMissing => "Missing Authorization header. Use: Authorization: Bearer <token>",
            Self::AuthInvalid => "Token verification failed",
            Self::KeyNotFound => "Key not found",
            Self::KeyProcessingError => "Failed to process key material",
            Self::KeyListError => "Failed to list keys",
            Self::KeyUploadError => "Failed to upload key",
            Self::KeyDeleteError => "Failed to delete key",
            Self::SignError => "Signing failed",
            Self::RateLimitError => "Rate limiter unavailable",
            Self::RateLimited => "Rate limit exceeded",
            Self::InvalidRequest => "Invalid request",
            Self::AuditError => "Audit query failed",
            Self::NotFound => "Not found",
            Self::InternalError => "Internal error",
        }
    }

    /// Wire representation (`SCREAMING_SNAKE_CASE`), for audit rows.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthMissing => "AUTH_MISSING",
            Self::AuthInvalid => "AUTH_INVALID",
            Self::KeyNotFound => "KEY_NOT_FOUND",
            Self::KeyProcessingError => "KEY_PROCESSING_ERROR",
            Self::KeyListError => "KEY_LIST_ERROR",
            Self::KeyUploadError => "KEY_UPLOAD_ERROR",
            Self::KeyDeleteError => "KEY_DELETE_ERROR",
            Self::SignError => "SIGN_ERROR",
            Self::RateLimitError => "RATE_LIMIT_ERROR",
            Self::RateLimited => "RATE_LIMITED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::AuditError => "AUDIT_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Tagged application error: code + status + message + optional context.
#[derive(Debug, Error)]
#[error("{code:?}: {message}")]
pub struct AppError {
    /// Wire error code
    pub code: ErrorCode,
    /// HTTP status (derived from the code unless overridden)
    pub status: StatusCode,
    /// Human-readable message; upstream `{error}` bodies are carried verbatim
    pub message: String,
    /// Optional structured context (never sent to clients)
    pub context: Option<serde_json::Value>,
}

impl AppError {
    /// Create an error with the code's generic message.
    #[must_use]
    pub fn code(code: ErrorCode) -> Self {
        Self::new(code, code.generic_message())
    }

    /// Create an error with a specific message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            status: code.status(),
            message: message.into(),
            context: None,
        }
    }

    /// Attach structured context for logging.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Some(ref ctx) = self.context {
            tracing::debug!(code = self.code.as_str(), context = %ctx, "request failed");
        }

        let mut body = json!({
            "error": self.message,
            "code": self.code,
        });
        if let Some(id) = request_id::current() {
            body["requestId"] = json!(id);
        }

        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        // GIVEN: each boundary-relevant code
        // THEN: wire form matches the closed set
        assert_eq!(
            serde_json::to_value(ErrorCode::KeyNotFound).unwrap(),
            "KEY_NOT_FOUND"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::RateLimited).unwrap(),
            "RATE_LIMITED"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::AuthInvalid).unwrap(),
            "AUTH_INVALID"
        );
    }

    #[test]
    fn as_str_matches_serde_form() {
        for code in [
            ErrorCode::AuthMissing,
            ErrorCode::AuthInvalid,
            ErrorCode::KeyNotFound,
            ErrorCode::KeyProcessingError,
            ErrorCode::KeyListError,
            ErrorCode::KeyUploadError,
            ErrorCode::KeyDeleteError,
            ErrorCode::SignError,
            ErrorCode::RateLimitError,
            ErrorCode::RateLimited,
            ErrorCode::InvalidRequest,
            ErrorCode::AuditError,
            ErrorCode::NotFound,
            ErrorCode::InternalError,
        ] {
            assert_eq!(serde_json::to_value(code).unwrap(), code.as_str());
        }
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorCode::AuthMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::KeyNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorCode::RateLimited.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ErrorCode::RateLimitError.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::InvalidRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ErrorCode::SignError.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn app_error_carries_upstream_message() {
        // GIVEN: an upstream `{error}` body surfaced verbatim
        let err = AppError::new(ErrorCode::KeyUploadError, "storage write failed: disk full");

        // THEN: message preserved, status derived
        assert_eq!(err.message, "storage write failed: disk full");
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
