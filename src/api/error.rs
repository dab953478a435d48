use crate::error::UploadError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Unsupported Media Type: {0}")]
    UnsupportedMediaType(String),

    #[error("Precondition Failed: {0}")]
    PreconditionFailed(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Upload(e) => match e {
                UploadError::OffsetMismatch { .. } => StatusCode::CONFLICT,
                UploadError::Unauthorized | UploadError::WrongHeaders(_) => {
                    StatusCode::UNAUTHORIZED
                }
                UploadError::NotFound => StatusCode::NOT_FOUND,
                UploadError::AlreadyPromoted => StatusCode::GONE,
                UploadError::ChunkOverflow { .. } | UploadError::InvalidRequest(_) => {
                    StatusCode::BAD_REQUEST
                }
                UploadError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                UploadError::PathIntegrity { .. }
                | UploadError::StorageIo { .. }
                | UploadError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status.is_server_error() {
            tracing::error!("Internal error: {:?}", self);
            "Internal Server Error".to_string()
        } else {
            match &self {
                AppError::Upload(e) => e.to_string(),
                AppError::BadRequest(msg)
                | AppError::UnsupportedMediaType(msg)
                | AppError::PreconditionFailed(msg)
                | AppError::Internal(msg) => msg.clone(),
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
