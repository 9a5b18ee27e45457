//! Error handling for the proxy.
//!
//! A single `AppError` enum covers the whole pipeline, with:
//! - RFC 7807 Problem Details response bodies
//! - HTTP status mapping per error category
//! - structured logging with correlation ids and key hashes (never secrets)

pub mod types;

use crate::context::CorrelationId;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

/// Standard error response format following RFC 7807 Problem Details.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// A URI reference that identifies the problem type
    #[serde(rename = "type")]
    pub error_type: String,

    /// A short, human-readable summary of the problem type
    pub title: String,

    /// The HTTP status code
    pub status: u16,

    /// A human-readable explanation specific to this occurrence
    pub detail: String,

    /// The request's correlation id; matches the server's log records for
    /// this request.
    pub request_id: Option<String>,
}

/// Main application error type.
///
/// The upstream-feedback variants (`UpstreamAuth`, `UpstreamBilling`,
/// `UpstreamRateLimit`, `UpstreamServer`) carry the key hash or service tag
/// so log records can be correlated with pool state transitions.
#[derive(Error, Debug)]
pub enum AppError {
    // Client-side request problems
    #[error("Invalid request body: {message}")]
    BadRequest { message: String },

    #[error("Unsupported dialect translation: {inbound} -> {outbound}")]
    Unsupported { inbound: String, outbound: String },

    // Pool availability
    #[error("No API keys configured for any service")]
    NoKeysConfigured,

    #[error("No usable API keys for service {service}")]
    NoKeysAvailable { service: String },

    #[error("All keys for service {service} are rate-limited (retry in {retry_after_ms}ms)")]
    TransientLockout {
        service: String,
        retry_after_ms: u64,
    },

    // Upstream feedback
    #[error("Upstream rejected credential {key_hash}")]
    UpstreamAuth { key_hash: String },

    #[error("Upstream reported billing failure for credential {key_hash}")]
    UpstreamBilling { key_hash: String },

    #[error("Upstream rate limit exhausted for service {service}")]
    UpstreamRateLimit { service: String },

    #[error("Upstream server error (status {status})")]
    UpstreamServer { status: u16 },

    // Transport
    #[error("HTTP client error: {message}")]
    HttpClient {
        message: String,
        status_code: Option<u16>,
    },

    #[error("Upstream deadline exceeded after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Client disconnected")]
    Cancelled,

    // Configuration
    #[error("Configuration error: {message}")]
    ConfigValidation { message: String },

    // System
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("IO operation failed: {message}")]
    Io { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn unsupported(inbound: impl Into<String>, outbound: impl Into<String>) -> Self {
        Self::Unsupported {
            inbound: inbound.into(),
            outbound: outbound.into(),
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } | Self::Unsupported { .. } | Self::Serialization { .. } => {
                StatusCode::BAD_REQUEST
            }

            // An empty eligible subset is a credential problem, not a server
            // fault.
            Self::NoKeysAvailable { .. } => StatusCode::PAYMENT_REQUIRED,

            Self::TransientLockout { .. } | Self::UpstreamRateLimit { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }

            Self::UpstreamAuth { .. }
            | Self::UpstreamBilling { .. }
            | Self::UpstreamServer { .. }
            | Self::HttpClient { .. } => StatusCode::BAD_GATEWAY,

            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            // The connection is gone; the status is never observed.
            Self::Cancelled => StatusCode::BAD_REQUEST,

            Self::NoKeysConfigured
            | Self::ConfigValidation { .. }
            | Self::Io { .. }
            | Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type URI for RFC 7807 compliance.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } | Self::Unsupported { .. } | Self::Serialization { .. } => {
                "https://llm-key-proxy.dev/errors/validation"
            }
            Self::NoKeysConfigured | Self::NoKeysAvailable { .. } => {
                "https://llm-key-proxy.dev/errors/key-pool"
            }
            Self::TransientLockout { .. } | Self::UpstreamRateLimit { .. } => {
                "https://llm-key-proxy.dev/errors/rate-limit"
            }
            Self::UpstreamAuth { .. } | Self::UpstreamBilling { .. } => {
                "https://llm-key-proxy.dev/errors/credential"
            }
            Self::UpstreamServer { .. } | Self::HttpClient { .. } | Self::Timeout { .. } => {
                "https://llm-key-proxy.dev/errors/upstream"
            }
            Self::ConfigValidation { .. } => "https://llm-key-proxy.dev/errors/configuration",
            _ => "https://llm-key-proxy.dev/errors/internal",
        }
    }

    /// Get a human-readable title for the error.
    pub fn title(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } | Self::Serialization { .. } => "Validation Error",
            Self::Unsupported { .. } => "Unsupported Dialect Pair",
            Self::NoKeysConfigured | Self::NoKeysAvailable { .. } => "No Keys Available",
            Self::TransientLockout { .. } | Self::UpstreamRateLimit { .. } => {
                "Rate Limit Exceeded"
            }
            Self::UpstreamAuth { .. } | Self::UpstreamBilling { .. } => "Credential Rejected",
            Self::UpstreamServer { .. } | Self::HttpClient { .. } => "Upstream Error",
            Self::Timeout { .. } => "Upstream Timeout",
            Self::ConfigValidation { .. } => "Configuration Error",
            _ => "Internal Server Error",
        }
    }

    /// Log the error with a level appropriate to its severity.
    pub fn log(&self, request_id: &str) {
        match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => {
                error!(
                    error = %self,
                    request_id = request_id,
                    error_type = self.error_type(),
                    "Request failed"
                );
            }
            _ => {
                warn!(
                    error = %self,
                    request_id = request_id,
                    error_type = self.error_type(),
                    "Client error"
                );
            }
        }
    }
}

impl AppError {
    /// Build the RFC 7807 response carrying the request's correlation id, so
    /// the id a client reports back matches the pipeline's log records.
    pub fn into_response_with_id(self, correlation_id: CorrelationId) -> Response {
        let request_id = correlation_id.to_string();
        self.log(&request_id);

        let status = self.status_code();
        let error_response = ErrorResponse {
            error_type: self.error_type().to_string(),
            title: self.title().to_string(),
            status: status.as_u16(),
            detail: self.to_string(),
            request_id: Some(request_id),
        };

        (status, Json(error_response)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Failures outside the request pipeline (extractor errors, startup)
        // have no correlation id yet; mint one so the response is still
        // traceable.
        self.into_response_with_id(CorrelationId::new())
    }
}

/// Result type alias for the application.
pub type Result<T, E = AppError> = std::result::Result<T, E>;
