//! tus 1.0.0 protocol adapter.
//!
//! Translates request framing (method, `Upload-*` headers, body) into
//! [`UploadSessionStore`] calls. Supports the core protocol plus the
//! `creation` and `termination` extensions.

use crate::config::UploadConfig;
use crate::services::session_store::{CompletedUpload, UploadSession, UploadSessionStore};
use crate::services::upload_error::UploadError;
use crate::utils::validation::{guess_content_type, sanitize_filename};
use axum::http::{HeaderMap, Method, header};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub const TUS_RESUMABLE: &str = "tus-resumable";
pub const TUS_VERSION: &str = "tus-version";
pub const TUS_EXTENSION: &str = "tus-extension";
pub const TUS_MAX_SIZE: &str = "tus-max-size";
pub const UPLOAD_OFFSET: &str = "upload-offset";
pub const UPLOAD_LENGTH: &str = "upload-length";
pub const UPLOAD_METADATA: &str = "upload-metadata";
pub const FILENAME: &str = "filename";

pub const SUPPORTED_VERSION: &str = "1.0.0";
pub const SUPPORTED_EXTENSIONS: &str = "creation,termination";
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// The parts of an inbound request the protocol looks at.
#[derive(Debug)]
pub struct TusRequest<'a> {
    pub method: &'a Method,
    pub upload_id: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum TusOutcome {
    /// Capability discovery
    Options,
    /// Upload opened, waiting for chunks
    Created { id: String, offset: u64 },
    /// Offset report for a live upload
    Status { offset: u64, length: u64 },
    /// Chunk stored, more expected
    Continue { offset: u64 },
    Terminated,
    /// Last chunk stored; the assembled upload is ready for content creation
    Finished {
        id: String,
        offset: u64,
        upload: CompletedUpload,
    },
}

pub struct TusAdapter {
    store: Arc<UploadSessionStore>,
    max_size: u64,
}

impl TusAdapter {
    pub fn new(store: Arc<UploadSessionStore>, config: &UploadConfig) -> Self {
        Self {
            store,
            max_size: config.max_size,
        }
    }

    pub fn store(&self) -> &Arc<UploadSessionStore> {
        &self.store
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// A request takes part in the protocol when it carries `Tus-Resumable`,
    /// uses one of the protocol's methods and is not a multipart form.
    pub fn is_applicable(method: &Method, headers: &HeaderMap) -> bool {
        let multipart = header_str(headers, header::CONTENT_TYPE.as_str())
            .is_some_and(|v| v.to_ascii_lowercase().starts_with("multipart/form-data"));
        headers.contains_key(TUS_RESUMABLE)
            && !multipart
            && (method == Method::OPTIONS
                || method == Method::POST
                || method == Method::HEAD
                || method == Method::PATCH
                || method == Method::DELETE)
    }

    pub async fn handle(&self, req: TusRequest<'_>) -> Result<TusOutcome, UploadError> {
        if *req.method == Method::OPTIONS {
            return Ok(TusOutcome::Options);
        }

        let version = header_str(req.headers, TUS_RESUMABLE).unwrap_or_default();
        if version != SUPPORTED_VERSION {
            return Err(UploadError::UnsupportedVersion(version.to_string()));
        }

        let method = req.method.clone();
        match method {
            Method::POST => self.create(req).await,
            Method::HEAD => {
                let session = self.store.status(require_id(&req)?).await?;
                Ok(TusOutcome::Status {
                    offset: session.bytes_received,
                    length: session.total_length,
                })
            }
            Method::PATCH => self.patch(req).await,
            Method::DELETE => {
                self.store.terminate(require_id(&req)?).await?;
                Ok(TusOutcome::Terminated)
            }
            other => Err(UploadError::protocol(format!(
                "method {other} is not part of the protocol"
            ))),
        }
    }

    /// Releases the temp file behind a finished upload once its content
    /// has been created.
    pub async fn cleanup_file(&self, temp_path: &Path) {
        self.store.release(temp_path).await;
    }

    async fn create(&self, req: TusRequest<'_>) -> Result<TusOutcome, UploadError> {
        let length = self.declared_length(req.headers)?.ok_or_else(|| {
            UploadError::protocol("Upload-Length is required to create an upload")
        })?;
        let metadata = parse_metadata(req.headers)?;

        let id = req
            .upload_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let mut session = self
            .store
            .open_with_metadata(&id, length, metadata)
            .await?;

        if !req.body.is_empty() {
            require_offset_content_type(req.headers)?;
            check_content_length(req.headers, req.body.len())?;
            session = self.store.append(&id, 0, &req.body).await?;
        }

        if session.completed {
            return self.finish(&id, session.bytes_received, req.headers).await;
        }

        info!(upload_id = %id, length, "tus upload created");
        Ok(TusOutcome::Created {
            id,
            offset: session.bytes_received,
        })
    }

    async fn patch(&self, req: TusRequest<'_>) -> Result<TusOutcome, UploadError> {
        let id = require_id(&req)?;
        require_offset_content_type(req.headers)?;
        let offset = parse_u64(req.headers, UPLOAD_OFFSET)?
            .ok_or_else(|| UploadError::protocol("Upload-Offset is required"))?;
        check_content_length(req.headers, req.body.len())?;
        let declared = self.declared_length(req.headers)?;

        match (self.store.status(id).await, declared) {
            (Ok(session), Some(length)) if length != session.total_length => {
                return Err(UploadError::protocol(format!(
                    "Upload-Length {} does not match the declared {}",
                    length, session.total_length
                )));
            }
            (Ok(_), _) => {}
            (Err(UploadError::NotFound(_)), Some(length)) if offset == 0 => {
                // First chunk for an identifier chosen by the client.
                let metadata = parse_metadata(req.headers)?;
                self.store.open_with_metadata(id, length, metadata).await?;
            }
            (Err(e), _) => return Err(e),
        }

        let session = if req.body.is_empty() {
            let session = self.store.status(id).await?;
            check_offset(&session, offset)?;
            session
        } else {
            self.store.append(id, offset, &req.body).await?
        };

        if session.completed {
            return self.finish(id, session.bytes_received, req.headers).await;
        }

        debug!(upload_id = %id, offset = session.bytes_received, "tus chunk accepted");
        Ok(TusOutcome::Continue {
            offset: session.bytes_received,
        })
    }

    async fn finish(
        &self,
        id: &str,
        offset: u64,
        headers: &HeaderMap,
    ) -> Result<TusOutcome, UploadError> {
        let mut upload = self.store.finalize(id).await?;

        if let Some(name) = header_str(headers, FILENAME).filter(|n| !n.is_empty()) {
            upload.filename = sanitize_filename(name);
            let guessed = guess_content_type(&upload.filename);
            if !guessed.is_empty() {
                upload.content_type = guessed;
            }
        }

        info!(upload_id = %id, filename = %upload.filename, "tus upload finished");
        Ok(TusOutcome::Finished {
            id: id.to_string(),
            offset,
            upload,
        })
    }

    fn declared_length(&self, headers: &HeaderMap) -> Result<Option<u64>, UploadError> {
        let length = parse_u64(headers, UPLOAD_LENGTH)?;
        if let Some(length) = length {
            if length > self.max_size {
                return Err(UploadError::TooLarge(format!(
                    "Upload-Length {} exceeds Tus-Max-Size {}",
                    length, self.max_size
                )));
            }
        }
        Ok(length)
    }
}

/// Decodes `Upload-Metadata`: comma separated `key base64(value)` pairs,
/// where the value may be omitted.
pub fn parse_metadata(headers: &HeaderMap) -> Result<HashMap<String, String>, UploadError> {
    let mut metadata = HashMap::new();
    let Some(raw) = header_str(headers, UPLOAD_METADATA) else {
        return Ok(metadata);
    };

    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = match pair.split_once(' ') {
            Some((key, encoded)) => {
                let decoded = STANDARD.decode(encoded.trim()).map_err(|e| {
                    UploadError::protocol(format!("metadata value for {key:?} is not base64: {e}"))
                })?;
                let value = String::from_utf8(decoded).map_err(|_| {
                    UploadError::protocol(format!("metadata value for {key:?} is not UTF-8"))
                })?;
                (key, value)
            }
            None => (pair, String::new()),
        };
        metadata.insert(key.to_string(), value);
    }

    Ok(metadata)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn parse_u64(headers: &HeaderMap, name: &str) -> Result<Option<u64>, UploadError> {
    header_str(headers, name)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| UploadError::protocol(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

fn require_id<'a>(req: &TusRequest<'a>) -> Result<&'a str, UploadError> {
    req.upload_id
        .ok_or_else(|| UploadError::protocol("request does not address an upload"))
}

fn require_offset_content_type(headers: &HeaderMap) -> Result<(), UploadError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if content_type.split(';').next().map(str::trim) != Some(OFFSET_OCTET_STREAM) {
        return Err(UploadError::protocol(format!(
            "Content-Type must be {OFFSET_OCTET_STREAM}"
        )));
    }
    Ok(())
}

fn check_content_length(headers: &HeaderMap, body_len: usize) -> Result<(), UploadError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    match declared {
        Some(len) if len != body_len => Err(UploadError::protocol(format!(
            "Content-Length {len} does not match the {body_len} bytes received"
        ))),
        _ => Ok(()),
    }
}

fn check_offset(session: &UploadSession, offset: u64) -> Result<(), UploadError> {
    if offset != session.bytes_received {
        return Err(UploadError::Range {
            id: session.id.clone(),
            expected: session.bytes_received,
            actual: offset,
        });
    }
    Ok(())
}
