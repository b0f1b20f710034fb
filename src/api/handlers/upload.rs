use crate::AppState;
use crate::api::error::AppError;
use crate::services::dispatcher::{
    DispatchOutcome, OneShotFile, UploadPayload, UploadRequest, UploadResult,
};
use crate::services::session_store::ByteSource;
use crate::services::tus::{
    SUPPORTED_EXTENSIONS, SUPPORTED_VERSION, TUS_EXTENSION, TUS_MAX_SIZE, TUS_RESUMABLE,
    TUS_VERSION, TusOutcome, UPLOAD_LENGTH, UPLOAD_OFFSET,
};
use axum::{
    Json,
    extract::{FromRequest, Multipart, Path, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use std::io::SeekFrom;
use tokio::io::AsyncSeekExt;
use tokio_util::io::StreamReader;

/// Multipart overhead allowed on top of the configured file size.
const BODY_OVERHEAD: usize = 10 * 1024 * 1024;

#[utoipa::path(
    post,
    path = "/containers/{container_id}/upload",
    params(
        ("container_id" = String, Path, description = "Container receiving the upload")
    ),
    request_body(content = Multipart, description = "One-shot upload with a `file` field, or a tus creation request"),
    responses(
        (status = 200, description = "Content created", body = UploadResult),
        (status = 201, description = "Resumable upload created"),
        (status = 204, description = "Nothing to do, or protocol step accepted"),
        (status = 404, description = "Container not found"),
        (status = 409, description = "Upload offset conflict"),
        (status = 412, description = "Unsupported tus version"),
        (status = 413, description = "Upload too large")
    ),
    tag = "upload"
)]
pub async fn upload(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
    request: Request,
) -> Result<Response, AppError> {
    handle(state, container_id, None, request).await
}

#[utoipa::path(
    patch,
    path = "/containers/{container_id}/upload/{upload_id}",
    params(
        ("container_id" = String, Path, description = "Container receiving the upload"),
        ("upload_id" = String, Path, description = "Resumable upload identifier")
    ),
    request_body(content = Vec<u8>, description = "Chunk bytes (application/offset+octet-stream)"),
    responses(
        (status = 200, description = "Last chunk stored and content created", body = UploadResult),
        (status = 204, description = "Chunk stored, more expected"),
        (status = 404, description = "Unknown upload"),
        (status = 409, description = "Upload offset conflict")
    ),
    tag = "upload"
)]
pub async fn upload_chunk(
    State(state): State<AppState>,
    Path((container_id, upload_id)): Path<(String, String)>,
    request: Request,
) -> Result<Response, AppError> {
    handle(state, container_id, Some(upload_id), request).await
}

async fn handle(
    state: AppState,
    container_id: String,
    upload_id: Option<String>,
    request: Request,
) -> Result<Response, AppError> {
    let method = request.method().clone();
    let headers = request.headers().clone();
    let path = request.uri().path().to_string();

    let payload = if is_multipart(&headers) {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        UploadPayload::Form(read_file_field(multipart).await?)
    } else {
        let limit = state.config.max_file_size + BODY_OVERHEAD;
        let body = axum::body::to_bytes(request.into_body(), limit)
            .await
            .map_err(body_error)?;
        UploadPayload::Raw(body)
    };

    let outcome = state
        .dispatcher
        .dispatch(UploadRequest {
            method,
            headers,
            context_id: container_id,
            upload_id,
            payload,
        })
        .await?;

    Ok(match outcome {
        DispatchOutcome::NothingToDo => StatusCode::NO_CONTENT.into_response(),
        DispatchOutcome::Created { result, offset } => {
            let mut response = Json(result).into_response();
            if let Some(offset) = offset {
                let headers = response.headers_mut();
                headers.insert(TUS_RESUMABLE, HeaderValue::from_static(SUPPORTED_VERSION));
                headers.insert(UPLOAD_OFFSET, HeaderValue::from(offset));
            }
            response
        }
        DispatchOutcome::Transfer(step) => {
            let location = format!("{}{}", state.config.portal_url, path.trim_end_matches('/'));
            transfer_response(step, &location, &state)?
        }
    })
}

fn transfer_response(step: TusOutcome, location: &str, state: &AppState) -> Result<Response, AppError> {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(SUPPORTED_VERSION));

    let status = match step {
        TusOutcome::Options => {
            headers.insert(TUS_VERSION, HeaderValue::from_static(SUPPORTED_VERSION));
            headers.insert(TUS_EXTENSION, HeaderValue::from_static(SUPPORTED_EXTENSIONS));
            let max_size = state
                .dispatcher
                .tus()
                .map(|tus| tus.max_size())
                .unwrap_or(state.config.upload.max_size);
            headers.insert(TUS_MAX_SIZE, HeaderValue::from(max_size));
            StatusCode::NO_CONTENT
        }
        TusOutcome::Created { id, offset } => {
            // POST to the collection gets a fresh identifier appended.
            let url = if location.ends_with(&format!("/{id}")) {
                location.to_string()
            } else {
                format!("{location}/{id}")
            };
            headers.insert(
                header::LOCATION,
                HeaderValue::from_str(&url).map_err(|e| AppError::Internal(e.to_string()))?,
            );
            headers.insert(UPLOAD_OFFSET, HeaderValue::from(offset));
            StatusCode::CREATED
        }
        TusOutcome::Status { offset, length } => {
            headers.insert(UPLOAD_OFFSET, HeaderValue::from(offset));
            headers.insert(UPLOAD_LENGTH, HeaderValue::from(length));
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
            StatusCode::OK
        }
        TusOutcome::Continue { offset } => {
            headers.insert(UPLOAD_OFFSET, HeaderValue::from(offset));
            StatusCode::NO_CONTENT
        }
        TusOutcome::Terminated => StatusCode::NO_CONTENT,
        TusOutcome::Finished { .. } => {
            return Err(AppError::Internal(
                "finished upload reached the transfer response".to_string(),
            ));
        }
    };

    Ok((status, headers).into_response())
}

fn is_multipart(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"))
}

fn body_error(e: axum::Error) -> AppError {
    let err_msg = e.to_string();
    if err_msg.contains("length limit exceeded") {
        AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
    } else {
        AppError::BadRequest(err_msg)
    }
}

/// Spools the `file` field to an anonymous temp file. Other fields are
/// skipped; a `file` field without a filename counts as no file.
async fn read_file_field(mut multipart: Multipart) -> Result<Option<OneShotFile>, AppError> {
    let mut file = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        let err_msg = e.to_string();
        if err_msg.contains("length limit exceeded") {
            AppError::PayloadTooLarge("Request body exceeds the maximum allowed limit".to_string())
        } else {
            AppError::BadRequest(err_msg)
        }
    })? {
        if field.name() != Some("file") || file.is_some() {
            continue;
        }
        let Some(filename) = field.file_name().filter(|n| !n.is_empty()).map(str::to_string)
        else {
            continue;
        };
        let content_type = field.content_type().map(|s| s.to_string());

        let spool = tempfile::tempfile().map_err(|e| AppError::Internal(e.to_string()))?;
        let mut spool = tokio::fs::File::from_std(spool);
        let body_with_io_error = field.map_err(std::io::Error::other);
        let reader = StreamReader::new(body_with_io_error);
        tokio::pin!(reader);
        let size = tokio::io::copy(&mut reader, &mut spool)
            .await
            .map_err(|e| AppError::BadRequest(e.to_string()))?;
        spool
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        file = Some(OneShotFile {
            filename,
            content_type,
            source: ByteSource::File(spool),
            size,
        });
    }

    Ok(file)
}
