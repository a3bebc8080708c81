//! Error responses in the Subsonic JSON shape.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use undertow_core::{StreamingError, UndertowError};

/// Subsonic error code for a generic error.
pub const CODE_GENERIC: u32 = 0;
/// Subsonic error code for a missing required parameter.
pub const CODE_MISSING_PARAMETER: u32 = 10;
/// Subsonic error code for a missing entity.
pub const CODE_NOT_FOUND: u32 = 70;

/// Errors returned by HTTP handlers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Required parameter '{name}' is missing")]
    MissingParameter { name: &'static str },

    #[error(transparent)]
    Streaming(#[from] StreamingError),

    #[error("Failed to build response: {reason}")]
    Response { reason: String },
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingParameter { .. } => StatusCode::BAD_REQUEST,
            ApiError::Streaming(e) if e.is_user_error() => StatusCode::BAD_REQUEST,
            ApiError::Streaming(e) if e.is_not_found() => StatusCode::NOT_FOUND,
            ApiError::Streaming(_) | ApiError::Response { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn subsonic_code(&self) -> u32 {
        match self {
            ApiError::MissingParameter { .. }
            | ApiError::Streaming(StreamingError::MissingParameter { .. }) => {
                CODE_MISSING_PARAMETER
            }
            ApiError::Streaming(e) if e.is_not_found() => CODE_NOT_FOUND,
            _ => CODE_GENERIC,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.subsonic_code();

        let message = match self {
            ApiError::MissingParameter { .. } => self.to_string(),
            ApiError::Streaming(e) => {
                if status.is_server_error() {
                    tracing::error!("Stream request failed: {}", e);
                }
                UndertowError::from(e).user_message()
            }
            ApiError::Response { ref reason } => {
                tracing::error!("Failed to build stream response: {}", reason);
                "Streaming error occurred".to_string()
            }
        };

        let body = serde_json::json!({
            "error": {
                "code": code,
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}
