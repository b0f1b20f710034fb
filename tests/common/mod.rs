#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::Response;
use cms_upload_backend::config::AppConfig;
use cms_upload_backend::entities::containers;
use cms_upload_backend::infrastructure::{database, seed};
use cms_upload_backend::services::content::insert_container;
use cms_upload_backend::services::storage::{StorageService, UploadResult};
use cms_upload_backend::{AppState, create_app};
use http_body_util::BodyExt;
use sea_orm::Database;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const BOUNDARY: &str = "X-CMS-UPLOAD-BOUNDARY";

pub struct MockStorageService {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockStorageService {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(key).cloned()
    }
}

#[async_trait]
impl StorageService for MockStorageService {
    async fn upload_stream_with_hash<'a>(
        &self,
        key: &str,
        mut reader: Box<dyn AsyncRead + Unpin + Send + 'a>,
    ) -> anyhow::Result<UploadResult> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let hash = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&data));
        let size = data.len() as i64;
        self.files.lock().unwrap().insert(key.to_string(), data);

        Ok(UploadResult {
            hash,
            size,
            key: key.to_string(),
        })
    }

    async fn delete_file(&self, key: &str) -> anyhow::Result<()> {
        self.files.lock().unwrap().remove(key);
        Ok(())
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub storage: Arc<MockStorageService>,
    pub root: containers::Model,
    /// `root/news`, allows subfolders
    pub news: containers::Model,
}

pub async fn setup(config: AppConfig) -> TestApp {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    database::run_migrations(&db).await.unwrap();
    let root = seed::seed_root_container(&db).await.unwrap();
    let news = insert_container(&db, Some(&root), "news", true).await.unwrap();

    let storage = Arc::new(MockStorageService::new());
    let state = AppState::new(db, storage.clone(), config);
    let app = create_app(state.clone());

    TestApp {
        app,
        state,
        storage,
        root,
        news,
    }
}

/// Config with resumable uploads spooled to `dir`.
pub fn resumable_config(dir: &std::path::Path) -> AppConfig {
    AppConfig {
        upload: cms_upload_backend::config::UploadConfig::enabled_in(dir),
        ..AppConfig::default()
    }
}

pub fn multipart_body(field: &str, filename: Option<&str>, content_type: &str, data: &[u8]) -> Vec<u8> {
    let disposition = match filename {
        Some(name) => format!("form-data; name=\"{field}\"; filename=\"{name}\""),
        None => format!("form-data; name=\"{field}\""),
    };
    let mut body = format!(
        "--{BOUNDARY}\r\nContent-Disposition: {disposition}\r\nContent-Type: {content_type}\r\n\r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub fn multipart_content_type() -> String {
    format!("multipart/form-data; boundary={BOUNDARY}")
}

pub async fn json_body(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
