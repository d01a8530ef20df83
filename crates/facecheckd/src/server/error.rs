use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use facecheck_core::RecognitionError;
use serde_json::json;

/// Handler failure, rendered as `{success: false, error}`.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Recognition(RecognitionError),
}

pub type Result<T, E = ApiError> = std::result::Result<T, E>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        let ApiError::Recognition(err) = self else {
            return StatusCode::BAD_REQUEST;
        };
        match err {
            RecognitionError::Decode(_)
            | RecognitionError::NoFaceDetected
            | RecognitionError::DetectorTimeout(_) => StatusCode::BAD_REQUEST,
            RecognitionError::EmptyGallery => StatusCode::SERVICE_UNAVAILABLE,
            RecognitionError::NoConfidentMatch { .. } | RecognitionError::UnknownRecord(_) => {
                StatusCode::NOT_FOUND
            }
            RecognitionError::NotifierFailure { .. } => StatusCode::BAD_GATEWAY,
            RecognitionError::EncodingCorrupt(_)
            | RecognitionError::Store(_)
            | RecognitionError::Cache(_)
            | RecognitionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            ApiError::BadRequest(message) => json!({ "success": false, "error": message }),
            ApiError::Recognition(RecognitionError::NotifierFailure { matched, .. }) => json!({
                "success": false,
                "error": self.message(),
                "match": matched,
            }),
            ApiError::Recognition(RecognitionError::NoConfidentMatch { best_distance }) => json!({
                "success": false,
                "error": self.message(),
                "best_distance": best_distance,
            }),
            ApiError::Recognition(_) => json!({ "success": false, "error": self.message() }),
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.message(), "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.message(), "request rejected");
        }
        (status, Json(body)).into_response()
    }
}

impl ApiError {
    fn message(&self) -> String {
        match self {
            ApiError::BadRequest(message) => message.clone(),
            ApiError::Recognition(err) => err.to_string(),
        }
    }
}

impl From<RecognitionError> for ApiError {
    fn from(err: RecognitionError) -> Self {
        Self::Recognition(err)
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(err: MultipartRejection) -> Self {
        Self::BadRequest(err.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        Self::BadRequest(err.body_text())
    }
}
