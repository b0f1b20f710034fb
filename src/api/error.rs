use crate::services::tus::{SUPPORTED_VERSION, TUS_RESUMABLE, TUS_VERSION};
use crate::services::upload_error::UploadError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Payload Too Large: {0}")]
    PayloadTooLarge(String),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Protocol errors are answered with an empty body and the protocol version,
/// the way tus clients expect them.
fn protocol_response(status: StatusCode, err: &UploadError) -> Response {
    tracing::debug!("Resumable request rejected ({}): {}", status, err);
    let mut response = status.into_response();
    let headers = response.headers_mut();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(SUPPORTED_VERSION));
    if matches!(err, UploadError::UnsupportedVersion(_)) {
        headers.insert(TUS_VERSION, HeaderValue::from_static(SUPPORTED_VERSION));
    }
    response
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Upload(e) if e.is_client_error() => {
                let status = match &e {
                    UploadError::Conflict(_) | UploadError::Range { .. } => StatusCode::CONFLICT,
                    UploadError::NotFound(_) => StatusCode::NOT_FOUND,
                    UploadError::UnsupportedVersion(_) => StatusCode::PRECONDITION_FAILED,
                    UploadError::TooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                    _ => StatusCode::BAD_REQUEST,
                };
                return protocol_response(status, &e);
            }
            AppError::Upload(UploadError::ContainerNotFound(id)) => {
                (StatusCode::NOT_FOUND, format!("Container {id} not found"))
            }
            AppError::Upload(e) => {
                tracing::error!("Upload failed: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
            AppError::PayloadTooLarge(msg) => (StatusCode::PAYLOAD_TOO_LARGE, msg),
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}
