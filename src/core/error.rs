//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that every pipeline
//! stage converts into, plus the HTTP response conversion used once, at the
//! handler boundary.

use crate::core::redact::redact_sensitive;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Public message used for every validation failure unless a more specific
/// caller-safe message is attached.
pub const INVALID_REQUEST: &str = "Invalid request";

/// Main error type for the application.
///
/// Every variant maps to exactly one HTTP status and one caller-safe message.
/// The `Display` output is the internal diagnostic and is only ever logged.
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed, oversized or disallowed input. Never retried.
    #[error("Validation failed: {detail}")]
    Validation { public: String, detail: String },

    /// Upstream rejected our credentials (401/403). Never retried and aborts
    /// the model fallback chain.
    #[error("Unauthorized")]
    Unauthorized,

    /// Upstream answered 429.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Any exceeded timeout bound on an upstream call.
    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Non-auth, non-2xx upstream response or transport failure.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Circuit breaker refused the call without contacting the upstream.
    #[error("Circuit breaker open for {0}")]
    CircuitOpen(String),

    /// Configuration-related errors (missing credentials, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Validation failure with the generic public message.
    pub fn validation(detail: impl Into<String>) -> Self {
        AppError::Validation {
            public: INVALID_REQUEST.to_string(),
            detail: detail.into(),
        }
    }

    /// Validation failure whose public message carries caller-safe guidance.
    pub fn validation_with_public(public: impl Into<String>, detail: impl Into<String>) -> Self {
        AppError::Validation {
            public: public.into(),
            detail: detail.into(),
        }
    }

    /// HTTP status carried by this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::Unavailable(_) | AppError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Request(e) if e.is_timeout() => StatusCode::REQUEST_TIMEOUT,
            AppError::Request(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to the caller. Never contains upstream payloads
    /// or internal exception text.
    pub fn public_message(&self) -> &str {
        match self {
            AppError::Validation { public, .. } => public,
            AppError::Unauthorized => "Unauthorized",
            AppError::RateLimitExceeded(_) => "Rate limit exceeded",
            AppError::Timeout(_) => "Request timeout",
            AppError::Unavailable(_) | AppError::CircuitOpen(_) => "Service unavailable",
            AppError::Request(e) if e.is_timeout() => "Request timeout",
            AppError::Request(_) => "Service unavailable",
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                "Internal server error"
            }
        }
    }

    /// Default retry condition: network errors, timeouts and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Timeout(_) | AppError::Unavailable(_) => true,
            AppError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }

    /// Credential failures abort every fallback path.
    pub fn is_auth(&self) -> bool {
        matches!(self, AppError::Unauthorized)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let internal = redact_sensitive(&self.to_string());

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %internal, "Request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %internal, "Request rejected");
        }

        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
