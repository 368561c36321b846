// API error type and the JSON envelope shared by every endpoint.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{error, warn};

use crate::subtitle::SubtitleError;

/// `{"success": true, "data": ...}` or `{"success": false, "error": "..."}`.
#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Wrap `data` in a success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        error: None,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    /// Expected failure with a message safe to show to the client.
    #[error("{0}")]
    Server(String),
    /// Anything else; details are logged, not returned.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Server(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SubtitleError> for ApiError {
    fn from(err: SubtitleError) -> Self {
        match err {
            SubtitleError::UnsupportedFormat(_) => Self::BadRequest(err.to_string()),
            SubtitleError::TooLarge { .. } => Self::PayloadTooLarge(err.to_string()),
            SubtitleError::SessionClosed => Self::BadRequest(err.to_string()),
            SubtitleError::Parse(_) | SubtitleError::Content(_) => Self::Server(err.to_string()),
            SubtitleError::Io(e) => Self::Internal(anyhow::Error::new(e).context("subtitle storage")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::Internal(e) => {
                error!("internal error: {:#}", e);
                "internal server error".to_string()
            }
            Self::Server(msg) => {
                warn!("request failed: {}", msg);
                msg.clone()
            }
            other => other.to_string(),
        };
        let body = Envelope::<()> {
            success: false,
            data: None,
            error: Some(message),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subtitle_errors_map_to_client_statuses() {
        let err: ApiError = SubtitleError::UnsupportedFormat("exe".into()).into();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("exe"));

        let err: ApiError = SubtitleError::TooLarge { size: 10, limit: 5 }.into();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let err: ApiError = SubtitleError::Parse(crate::subtitle::CodecError::NoCues).into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("no subtitle cues"));
    }

    #[test]
    fn test_envelope_shape() {
        let json = serde_json::to_value(ok(3).0).unwrap();
        assert_eq!(json, serde_json::json!({"success": true, "data": 3}));
    }
}
