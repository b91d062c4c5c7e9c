//! Error types and handling for the appview
//!
//! Provides a unified error type that converts to appropriate HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unable to save to PDS: {0}")]
    PdsTransport(String),

    #[error("record changed concurrently")]
    PdsConflict,

    #[error("{host} does not support this operation yet")]
    RemoteUnsupported { host: String },

    #[error("remote service error: {0}")]
    RemoteTransport(String),

    #[error("index error: {0}")]
    Index(#[from] sqlx::Error),

    #[error("session store error: {0}")]
    SessionStore(#[from] redis::RedisError),

    #[error("OAuth error: {0}")]
    OAuth(String),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "invalid_input", msg.clone()),
            AppError::NotAuthenticated => (
                StatusCode::UNAUTHORIZED,
                "not_authenticated",
                "Your session has expired. Please log in again.".to_string(),
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            AppError::AlreadyExists(msg) => (StatusCode::CONFLICT, "already_exists", msg.clone()),
            AppError::PdsTransport(msg) => {
                tracing::error!("PDS transport error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "pds_unavailable",
                    "Unable to save to your PDS. Try again later.".to_string(),
                )
            }
            AppError::PdsConflict => (
                StatusCode::CONFLICT,
                "record_changed",
                "The record changed concurrently. Reload and try again.".to_string(),
            ),
            AppError::RemoteUnsupported { host } => (
                StatusCode::BAD_GATEWAY,
                "needs_knot_upgrade",
                format!("{host} is running an older version and needs an upgrade"),
            ),
            AppError::RemoteTransport(msg) => {
                tracing::error!("remote transport error: {}", msg);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "remote_unavailable",
                    "The repository host is unreachable. Try again later.".to_string(),
                )
            }
            AppError::Index(e) => {
                tracing::error!("index error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Something went wrong. Try again later.".to_string(),
                )
            }
            AppError::SessionStore(e) => {
                tracing::error!("session store error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Something went wrong. Try again later.".to_string(),
                )
            }
            AppError::OAuth(msg) => (StatusCode::BAD_REQUEST, "oauth_error", msg.clone()),
            AppError::HttpClient(e) => {
                tracing::error!("HTTP client error: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    "Failed to communicate with an upstream server".to_string(),
                )
            }
            AppError::Json(e) => {
                tracing::error!("JSON error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Failed to process response".to_string(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("config error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Server configuration error".to_string(),
                )
            }
            AppError::Crypto(msg) => {
                tracing::error!("crypto error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Cryptographic operation failed".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    msg.clone(),
                )
            }
        };

        let body = Json(json!({
            "error": error_type,
            "message": message,
        }));

        (status, body).into_response()
    }
}

/// Result type alias for handlers
pub type AppResult<T> = Result<T, AppError>;
