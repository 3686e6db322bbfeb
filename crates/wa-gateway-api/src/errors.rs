//! Error types for the HTTP service
//!
//! Handler errors map to JSON bodies of the form
//! `{ "error": ..., "status": ..., "timestamp": ... }`. Server-side failures
//! are logged in full and answered with a generic message.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use wa_gateway_core::{
    AuthError, DispatchError, IngestionError, Permission, StorageError, ValidationError,
};
use tracing::{error, warn};

fn error_response(status: StatusCode, message: String) -> Response {
    let body = serde_json::json!({
        "error": message,
        "status": status.as_u16(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (status, Json(body)).into_response()
}

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error occurred. Please try again later.";

// ============================================================================
// Webhook errors
// ============================================================================

/// Errors returned by the webhook endpoints
///
/// - `400 Bad Request`: the body is not a webhook envelope
/// - `403 Forbidden`: signature or subscription token mismatch
/// - `500 Internal Server Error`: storage failed for at least one event; the
///   provider redelivers and idempotent application makes that safe
#[derive(Debug, thiserror::Error)]
pub enum WebhookHandlerError {
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error("Webhook verification failed")]
    VerificationFailed,
}

impl IntoResponse for WebhookHandlerError {
    fn into_response(self) -> Response {
        match self {
            Self::Ingestion(IngestionError::Database { failures, .. }) => {
                error!(failures, "Webhook delivery hit storage failures");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    INTERNAL_ERROR_MESSAGE.to_string(),
                )
            }
            Self::Ingestion(e) => {
                let status =
                    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
                warn!(status = %status, error = %e, "Webhook rejected");
                error_response(status, e.to_string())
            }
            Self::VerificationFailed => {
                warn!("Webhook subscription verification failed");
                error_response(StatusCode::FORBIDDEN, self.to_string())
            }
        }
    }
}

// ============================================================================
// API errors
// ============================================================================

/// Errors returned by the authenticated API endpoints
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing, unknown or expired API key
    #[error("Invalid or missing API key")]
    Unauthorized,

    #[error("API key lacks permission '{permission}'")]
    Forbidden { permission: Permission },

    #[error("{message}")]
    BadRequest { message: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: String, id: String },

    /// A dependency is missing or temporarily down
    #[error("{message}")]
    ServiceUnavailable { message: String },

    #[error("Internal server error: {message}")]
    Internal { message: String },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::BadRequest {
            message: e.to_string(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { entity, id } => Self::NotFound { entity, id },
            StorageError::Validation(v) => v.into(),
            e if e.is_transient() => Self::ServiceUnavailable {
                message: "Storage is temporarily unavailable".to_string(),
            },
            e => Self::Internal {
                message: e.to_string(),
            },
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Unauthorized => Self::Unauthorized,
            AuthError::Forbidden { permission } => Self::Forbidden { permission },
            AuthError::Storage(s) => s.into(),
            AuthError::Hashing { message } => Self::Internal { message },
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Validation(v) => v.into(),
            DispatchError::Storage(s) => s.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Internal { message } => {
                error!(error = %message, "Internal server error occurred");
                INTERNAL_ERROR_MESSAGE.to_string()
            }
            Self::ServiceUnavailable { message } => {
                warn!(error = %message, "Service unavailable");
                self.to_string()
            }
            _ => self.to_string(),
        };

        let mut response = error_response(status, message);
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(
                axum::http::header::RETRY_AFTER,
                axum::http::HeaderValue::from_static("30"),
            );
        }
        response
    }
}

// ============================================================================
// Service errors
// ============================================================================

/// Service-level errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to bind to address {address}: {message}")]
    BindFailed { address: String, message: String },

    #[error("Server failed: {message}")]
    ServerFailed { message: String },

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },
}

#[cfg(test)]
#[path = "errors_tests.rs"]
mod tests;
