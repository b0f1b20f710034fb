//! Single entry point for upload requests.
//!
//! Decides between the resumable and the one-shot path, then hands the
//! finished bytes to container resolution and content creation.

use crate::config::AppConfig;
use crate::entities::prelude::*;
use crate::services::content::{
    ContainerResolver, FactoryRegistry, IdentityResolver, absolute_url, find_type_name,
};
use crate::services::session_store::{ByteSource, CompletedUpload};
use crate::services::tus::{TusAdapter, TusOutcome, TusRequest};
use crate::services::upload_error::UploadError;
use crate::utils::validation::{guess_content_type, sanitize_filename};
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

/// A `file` field of a one-shot multipart upload.
#[derive(Debug)]
pub struct OneShotFile {
    pub filename: String,
    /// Content type sent with the part, if any
    pub content_type: Option<String>,
    pub source: ByteSource,
    pub size: u64,
}

impl OneShotFile {
    /// Client supplied types that say nothing are replaced by a guess from
    /// the filename.
    pub fn into_completed(self) -> CompletedUpload {
        let filename = sanitize_filename(&self.filename);
        let content_type = self
            .content_type
            .filter(|t| !t.is_empty() && t.as_str() != mime::APPLICATION_OCTET_STREAM.essence_str())
            .unwrap_or_else(|| guess_content_type(&filename));

        CompletedUpload {
            filename,
            content_type,
            source: self.source,
            size: self.size,
            temp_path: None,
        }
    }
}

#[derive(Debug)]
pub enum UploadPayload {
    /// Raw request body (resumable chunks)
    Raw(Bytes),
    /// Multipart form; `None` when it had no usable `file` field
    Form(Option<OneShotFile>),
}

#[derive(Debug)]
pub struct UploadRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub context_id: String,
    pub upload_id: Option<String>,
    pub payload: UploadPayload,
}

/// JSON answer for a created object.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadResult {
    #[serde(rename = "type")]
    pub content_type: String,
    pub size: i64,
    pub url: String,
    pub name: String,
    #[serde(rename = "UID")]
    pub uid: String,
    pub filename: String,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Not an upload this endpoint handles
    NothingToDo,
    /// A resumable protocol step that did not finish a transfer
    Transfer(TusOutcome),
    /// Content was created; `offset` is set when it came through the resumable path
    Created {
        result: UploadResult,
        offset: Option<u64>,
    },
}

pub struct UploadDispatcher {
    db: DatabaseConnection,
    portal_url: String,
    tus: Option<TusAdapter>,
    resolver: Arc<dyn ContainerResolver>,
    factories: FactoryRegistry,
    identity: Arc<dyn IdentityResolver>,
}

impl UploadDispatcher {
    pub fn new(
        db: DatabaseConnection,
        config: &AppConfig,
        tus: Option<TusAdapter>,
        resolver: Arc<dyn ContainerResolver>,
        factories: FactoryRegistry,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        Self {
            db,
            portal_url: config.portal_url.clone(),
            tus,
            resolver,
            factories,
            identity,
        }
    }

    pub fn resumable_enabled(&self) -> bool {
        self.tus.is_some()
    }

    pub fn tus(&self) -> Option<&TusAdapter> {
        self.tus.as_ref()
    }

    pub async fn dispatch(&self, req: UploadRequest) -> Result<DispatchOutcome, UploadError> {
        let context = Containers::find_by_id(&req.context_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| UploadError::ContainerNotFound(req.context_id.clone()))?;

        let (upload, offset) = match &self.tus {
            Some(tus) if TusAdapter::is_applicable(&req.method, &req.headers) => {
                let body = match req.payload {
                    UploadPayload::Raw(body) => body,
                    UploadPayload::Form(_) => {
                        return Err(UploadError::protocol(
                            "resumable requests carry raw bytes, not a form",
                        ));
                    }
                };
                let outcome = tus
                    .handle(TusRequest {
                        method: &req.method,
                        upload_id: req.upload_id.as_deref(),
                        headers: &req.headers,
                        body,
                    })
                    .await?;
                match outcome {
                    TusOutcome::Finished { offset, upload, .. } => (upload, Some(offset)),
                    other => return Ok(DispatchOutcome::Transfer(other)),
                }
            }
            _ => {
                if req.method != Method::POST {
                    debug!("Ignoring {} without a resumable marker", req.method);
                    return Ok(DispatchOutcome::NothingToDo);
                }
                match req.payload {
                    UploadPayload::Form(Some(file)) => (file.into_completed(), None),
                    _ => return Ok(DispatchOutcome::NothingToDo),
                }
            }
        };

        let temp_path = upload.temp_path.clone();
        let created = self.create_content(&context, upload).await;
        if let Some(path) = temp_path {
            self.release(&path).await;
        }

        Ok(DispatchOutcome::Created {
            result: created?,
            offset,
        })
    }

    async fn create_content(
        &self,
        context: &crate::entities::containers::Model,
        upload: CompletedUpload,
    ) -> Result<UploadResult, UploadError> {
        let CompletedUpload {
            filename,
            content_type,
            source,
            ..
        } = upload;

        let type_name = find_type_name(&guess_content_type(&filename.to_lowercase()));
        let container = self.resolver.resolve(context).await?;
        let factory = self.factories.select(type_name);

        let object = factory
            .create(&container, type_name, &filename, &content_type, source)
            .await?;
        let (size, content_type) = object.size_and_type();
        let uid = self.identity.uid(&object)?;
        let item = object.item();

        info!(
            uid = %uid,
            container = %container.path,
            "✅ Upload stored as {} ({} bytes)",
            item.name,
            size
        );

        Ok(UploadResult {
            content_type,
            size,
            url: absolute_url(&self.portal_url, &container.path, &item.name),
            name: item.name.clone(),
            uid,
            filename,
        })
    }

    async fn release(&self, path: &Path) {
        match &self.tus {
            Some(tus) => tus.cleanup_file(path).await,
            None => {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!("Failed to remove temp file {:?}: {}", path, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_one_shot_guesses_missing_type() {
        let file = OneShotFile {
            filename: "C:\\Users\\me\\photo.png".to_string(),
            content_type: Some("application/octet-stream".to_string()),
            source: ByteSource::Memory(Bytes::from_static(b"png")),
            size: 3,
        };
        let completed = file.into_completed();
        assert_eq!(completed.filename, "photo.png");
        assert_eq!(completed.content_type, "image/png");
        assert!(completed.temp_path.is_none());
    }

    #[test]
    fn test_one_shot_keeps_explicit_type() {
        let file = OneShotFile {
            filename: "notes".to_string(),
            content_type: Some("text/markdown".to_string()),
            source: ByteSource::Memory(Bytes::new()),
            size: 0,
        };
        assert_eq!(file.into_completed().content_type, "text/markdown");

        let file = OneShotFile {
            filename: "notes.unknownext".to_string(),
            content_type: None,
            source: ByteSource::Memory(Bytes::new()),
            size: 0,
        };
        assert_eq!(file.into_completed().content_type, "");
    }

    #[test]
    fn test_result_json_shape() {
        let result = UploadResult {
            content_type: "image/png".to_string(),
            size: 3,
            url: "http://localhost:3000/images/photo.png".to_string(),
            name: "photo.png".to_string(),
            uid: "abc".to_string(),
            filename: "photo.png".to_string(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "image/png");
        assert_eq!(json["UID"], "abc");
        assert_eq!(json["size"], 3);
        assert!(json.get("content_type").is_none());
    }

    #[tokio::test]
    async fn test_release_without_resumable_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spool");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"x")
            .unwrap();

        let db = sea_orm::Database::connect("sqlite::memory:").await.unwrap();
        let storage: Arc<dyn crate::services::storage::StorageService> =
            Arc::new(NullStorage);
        let config = AppConfig::default();
        let dispatcher = UploadDispatcher::new(
            db.clone(),
            &config,
            None,
            Arc::new(crate::services::content::RepositoryContainerResolver::new(
                db.clone(),
                Arc::new(crate::services::content::RepositoryWorkflow::new(db.clone())),
                "images",
            )),
            FactoryRegistry::new(db, storage, &config),
            Arc::new(crate::services::content::ItemUid),
        );
        assert!(!dispatcher.resumable_enabled());

        dispatcher.release(&path).await;
        assert!(!path.exists());
    }

    struct NullStorage;

    #[async_trait::async_trait]
    impl crate::services::storage::StorageService for NullStorage {
        async fn upload_stream_with_hash<'a>(
            &self,
            key: &str,
            _reader: Box<dyn tokio::io::AsyncRead + Unpin + Send + 'a>,
        ) -> anyhow::Result<crate::services::storage::UploadResult> {
            Ok(crate::services::storage::UploadResult {
                hash: String::new(),
                size: 0,
                key: key.to_string(),
            })
        }

        async fn delete_file(&self, _key: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }
}
