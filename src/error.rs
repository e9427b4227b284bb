use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::extract::ExtractError;
use crate::matcher::MatchError;

pub type ApiResult<T> = Result<T, ApiError>;

/// Every failure a handler can surface. The response body is always
/// `{"error": "<message>"}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("request body too large: {0}")]
    PayloadTooLarge(String),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("not found")]
    NotFound,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) | ApiError::Match(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Extract(ExtractError::Worker(_)) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Extract(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        if status.is_server_error() {
            log::error!("{}", message);
        } else if matches!(self, ApiError::Extract(_)) {
            log::warn!("extraction failed: {}", message);
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(err.body_text())
        } else {
            ApiError::BadRequest(err.body_text())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_codes_by_kind() {
        assert_eq!(
            ApiError::BadRequest("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(MatchError::EmptyQuery).status_code(),
            StatusCode::BAD_REQUEST
        );
        for err in [
            ExtractError::NoFace,
            ExtractError::Timeout(Duration::from_secs(30)),
            ExtractError::Model(anyhow::anyhow!("bad tensor")),
        ] {
            assert_eq!(
                ApiError::from(err).status_code(),
                StatusCode::UNPROCESSABLE_ENTITY
            );
        }
        assert_eq!(
            ApiError::from(ExtractError::Worker("panic".into())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn messages_pass_through() {
        assert_eq!(
            ApiError::from(ExtractError::NoFace).to_string(),
            "no face detected in image"
        );
        assert_eq!(
            ApiError::BadRequest("No image uploaded".into()).to_string(),
            "No image uploaded"
        );
    }
}
