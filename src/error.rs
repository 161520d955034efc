use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::{extractor::ExtractionError, store::StoreError};

/// Longest raw diagnostic text returned to clients.
pub const MAX_DETAILS_CHARS: usize = 200;

#[derive(Debug, Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            details: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(truncate_details(details));
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            success: false,
            error: self.message,
            details: self.details,
        });

        (self.status, body).into_response()
    }
}

impl From<ExtractionError> for ApiError {
    fn from(error: ExtractionError) -> Self {
        ApiError::internal(error.to_string()).with_details(error.detail())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::internal("Failed to store converted audio").with_details(&error.to_string())
    }
}

/// Cuts diagnostic text to [`MAX_DETAILS_CHARS`] characters, never inside a
/// multi-byte character.
pub fn truncate_details(raw: &str) -> String {
    raw.trim().chars().take(MAX_DETAILS_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use serde_json::Value;

    use super::*;

    #[test]
    fn truncates_on_character_boundaries() {
        let long = "é".repeat(500);
        let truncated = truncate_details(&long);
        assert_eq!(truncated.chars().count(), MAX_DETAILS_CHARS);

        assert_eq!(truncate_details("  short  "), "short");
    }

    #[tokio::test]
    async fn renders_json_envelope() {
        let response = ApiError::bad_request("Invalid YouTube URL format").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Invalid YouTube URL format");
        assert!(body.get("details").is_none());
    }

    #[test]
    fn extraction_errors_become_internal_with_details() {
        let error = ApiError::from(ExtractionError::Blocked("HTTP Error 403".repeat(40)));

        assert_eq!(error.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message, "YouTube blocked the request (403 Forbidden)");
        assert_eq!(
            error.details.as_deref().map(|details| details.chars().count()),
            Some(MAX_DETAILS_CHARS)
        );
    }
}
