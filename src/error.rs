//! Error types for cachewise.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::registry::CapabilityTier;
use crate::router::retry::{format_attempts, AttemptRecord};

/// Result type alias for cachewise operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cachewise.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Model '{model}' not found")]
    ModelNotFound { model: String },

    #[error("No available model can serve tier '{tier}'")]
    NoCandidates { tier: CapabilityTier },

    #[error("All candidates exhausted: {}", format_attempts(.attempts))]
    AllCandidatesExhausted { attempts: Vec<AttemptRecord> },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) | Error::ModelNotFound { .. } => StatusCode::BAD_REQUEST,
            Error::NoCandidates { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::AllCandidatesExhausted { .. } => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) | Error::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Short machine-readable category.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::Validation(_) => "validation_error",
            Error::ModelNotFound { .. } => "model_not_found",
            Error::NoCandidates { .. } => "no_candidates",
            Error::AllCandidatesExhausted { .. } => "all_candidates_exhausted",
            Error::Internal(_) => "internal_error",
            Error::Database(_) => "database_error",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // OpenAI-compatible error format
        let mut body = serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.kind(),
                "code": status.as_u16()
            }
        });
        if let Error::AllCandidatesExhausted { attempts } = &self {
            body["error"]["attempts"] = serde_json::to_value(attempts).unwrap_or_default();
        }

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_lists_attempts() {
        let err = Error::AllCandidatesExhausted {
            attempts: vec![
                AttemptRecord {
                    model: "test/opus".to_string(),
                    error: "rate limited".to_string(),
                    retryable: true,
                },
                AttemptRecord {
                    model: "test/sonnet".to_string(),
                    error: "timed out after 100ms".to_string(),
                    retryable: true,
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("test/opus: rate limited"));
        assert!(msg.contains("test/sonnet: timed out after 100ms"));
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_validation_is_client_error() {
        let err = Error::Validation("user_input must not be empty".into());
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.kind(), "validation_error");
    }
}
