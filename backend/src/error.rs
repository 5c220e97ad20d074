use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use shared::ErrorResponse;

use crate::pipeline::PipelineError;
use crate::storage::pinata_service::UploadError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    MissingInput(String),
    #[error("Unsupported file format. Please upload an image or video.")]
    UnsupportedFormat,
    #[error("No faces detected in the file.")]
    NoFacesDetected,
    #[error("Unable to read the uploaded media: {0}")]
    InvalidMedia(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    #[error("Failed to upload file to IPFS: {0}")]
    UploadFailure(#[from] UploadError),
    #[error("Processing exceeded the {0}s time limit.")]
    ProcessingTimeout(u64),
    #[error("{0}")]
    Internal(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MissingInput(_)
            | AppError::UnsupportedFormat
            | AppError::NoFacesDetected
            | AppError::InvalidMedia(_) => StatusCode::BAD_REQUEST,
            AppError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::ProcessingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::UploadFailure(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::NoFacesDetected => AppError::NoFacesDetected,
            PipelineError::Media(e) if e.is_too_large() => AppError::PayloadTooLarge(e.to_string()),
            PipelineError::Media(e) if e.is_unreadable() => AppError::InvalidMedia(e.to_string()),
            PipelineError::Timeout { limit_secs } => AppError::ProcessingTimeout(limit_secs),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<actix_web::error::BlockingError> for AppError {
    fn from(err: actix_web::error::BlockingError) -> Self {
        AppError::Internal(format!("Worker pool failure: {}", err))
    }
}
