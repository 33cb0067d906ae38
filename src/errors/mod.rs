//! Error type definitions for tuner-bridge
//!
//! A layered error system: `AppError` is the top-level type handlers and
//! services return; the domain enums below feed into it via `#[from]`.
//! Errors inside a streaming session never cross session boundaries — they
//! are translated into a session end reason by the session manager.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Top-level application error type
#[derive(Error, Debug)]
pub enum AppError {
    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Validation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Resource not found errors
    #[error("Not found: {resource} with id {id}")]
    NotFound { resource: String, id: String },

    /// Admission control rejections (carry their HTTP status)
    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    /// Stream handling errors
    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// HTTP client errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Admission-control rejections from the session manager
#[derive(Error, Debug, Clone)]
pub enum AdmissionError {
    #[error("Maximum concurrent streams reached ({active}/{max})")]
    AtCapacity { active: usize, max: usize },

    #[error("Channel {channel_id} is at its concurrent session limit ({active}/{max})")]
    ChannelAtCapacity {
        channel_id: String,
        active: usize,
        max: usize,
    },

    #[error("A conflicting session already exists for this client")]
    DuplicateConflict,

    #[error("Shutting down, not accepting new sessions")]
    ShuttingDown,
}

impl AdmissionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::AtCapacity { .. }
            | AdmissionError::ChannelAtCapacity { .. }
            | AdmissionError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::DuplicateConflict => StatusCode::CONFLICT,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            AdmissionError::AtCapacity { .. } => "max_concurrent_streams",
            AdmissionError::ChannelAtCapacity { .. } => "channel_session_limit",
            AdmissionError::DuplicateConflict => "duplicate_client_session",
            AdmissionError::ShuttingDown => "shutting_down",
        }
    }
}

/// Stream resolution and encoder errors
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Unrecognized stream format: {url}")]
    UnknownFormat { url: String },

    #[error("Upstream resolution failed: {message}")]
    ResolutionFailed { message: String },

    #[error("Redirect chain exceeded {limit} hops for {url}")]
    TooManyRedirects { url: String, limit: usize },

    #[error("Encoder process failed: {message}")]
    EncoderFailed { message: String },

    #[error("Upstream returned HTTP {status}")]
    UpstreamStatus { status: u16 },
}

/// Cache backend errors. Never propagated to callers of the cache service:
/// every failure degrades to a miss and a warn-level log line.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend unavailable")]
    Unavailable,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::Validation { .. } => StatusCode::BAD_REQUEST,
            AppError::Admission(e) => e.status_code(),
            AppError::Stream(StreamError::UnknownFormat { .. }) => StatusCode::BAD_REQUEST,
            AppError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            AppError::Admission(e) => serde_json::json!({
                "error": self.to_string(),
                "reason": e.reason(),
            }),
            _ => serde_json::json!({ "error": self.to_string() }),
        };
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_map_to_policy_status() {
        let err = AdmissionError::AtCapacity { active: 5, max: 5 };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(err.to_string().contains("Maximum concurrent streams reached"));

        let err = AdmissionError::ChannelAtCapacity {
            channel_id: "ch1".into(),
            active: 3,
            max: 3,
        };
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        assert_eq!(
            AdmissionError::DuplicateConflict.status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn unknown_format_is_bad_request() {
        let err = AppError::Stream(StreamError::UnknownFormat {
            url: "mystery://x".into(),
        });
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
