use super::{BlobField, ContentFactory, CreatedObject};
use crate::config::AppConfig;
use crate::entities::{containers, content_items, prelude::*};
use crate::services::session_store::ByteSource;
use crate::services::storage::StorageService;
use crate::utils::validation::{choose_unique_name, normalize_object_name};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub const IMAGE_TYPE: &str = "Image";
pub const FILE_TYPE: &str = "File";

/// Content type name for an upload: images become `Image`, the rest `File`.
pub fn find_type_name(content_type: &str) -> &'static str {
    if content_type.starts_with("image/") {
        IMAGE_TYPE
    } else {
        FILE_TYPE
    }
}

struct ItemDraft<'a> {
    container: &'a containers::Model,
    portal_type: &'a str,
    schema_kind: &'static str,
    primary_field: Option<&'static str>,
    filename: &'a str,
    content_type: &'a str,
}

/// Shared persistence for both factories: picks a free name, streams the
/// bytes to blob storage and inserts the item row.
struct ItemWriter {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
}

impl ItemWriter {
    async fn taken_names(&self, container_id: &str) -> Result<HashSet<String>> {
        let mut names: HashSet<String> = ContentItems::find()
            .filter(content_items::Column::ContainerId.eq(container_id))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|i| i.name)
            .collect();
        names.extend(
            Containers::find()
                .filter(containers::Column::ParentId.eq(container_id))
                .all(&self.db)
                .await?
                .into_iter()
                .map(|c| c.name),
        );
        Ok(names)
    }

    async fn write(&self, draft: ItemDraft<'_>, source: ByteSource) -> Result<content_items::Model> {
        let taken = self.taken_names(&draft.container.id).await?;
        let name = choose_unique_name(&normalize_object_name(draft.filename), |n| {
            taken.contains(n)
        });

        let uid = Uuid::new_v4().simple().to_string();
        let blob_key = format!("blobs/{}", uid);

        let reader = source.into_reader().await?;
        let stored = self.storage.upload_stream_with_hash(&blob_key, reader).await?;

        let item = content_items::ActiveModel {
            uid: Set(uid.clone()),
            container_id: Set(draft.container.id.clone()),
            name: Set(name),
            portal_type: Set(draft.portal_type.to_string()),
            schema_kind: Set(draft.schema_kind.to_string()),
            primary_field: Set(draft.primary_field.map(str::to_string)),
            filename: Set(draft.filename.to_string()),
            content_type: Set(draft.content_type.to_string()),
            size: Set(stored.size),
            blob_key: Set(stored.key.clone()),
            hash: Set(stored.hash),
            created_at: Set(Utc::now().into()),
        };

        match item.insert(&self.db).await {
            Ok(model) => {
                info!(
                    uid = %model.uid,
                    container = %draft.container.path,
                    "📄 Created {} {} ({} bytes)",
                    model.portal_type,
                    model.name,
                    model.size
                );
                Ok(model)
            }
            Err(e) => {
                // Don't leave an orphaned blob behind.
                if let Err(del) = self.storage.delete_file(&stored.key).await {
                    warn!("Failed to delete orphaned blob {}: {}", stored.key, del);
                }
                Err(e.into())
            }
        }
    }
}

/// Creates schema-based items whose blob lives in a `file` or `image` field.
pub struct SchemaFileFactory {
    writer: ItemWriter,
}

impl SchemaFileFactory {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>) -> Self {
        Self {
            writer: ItemWriter { db, storage },
        }
    }
}

#[async_trait]
impl ContentFactory for SchemaFileFactory {
    async fn create(
        &self,
        container: &containers::Model,
        type_name: &str,
        filename: &str,
        content_type: &str,
        source: ByteSource,
    ) -> Result<CreatedObject> {
        let field = if type_name == IMAGE_TYPE { "image" } else { "file" };

        let item = self
            .writer
            .write(
                ItemDraft {
                    container,
                    portal_type: type_name,
                    schema_kind: "schema",
                    primary_field: Some(field),
                    filename,
                    content_type,
                },
                source,
            )
            .await?;

        let blob = BlobField {
            filename: item.filename.clone(),
            content_type: item.content_type.clone(),
            size: item.size,
            blob_key: item.blob_key.clone(),
        };
        let (file, image) = if field == "image" {
            (None, Some(blob))
        } else {
            (Some(blob), None)
        };

        Ok(CreatedObject::Schema { item, file, image })
    }
}

/// Creates legacy items that expose size and content type directly.
pub struct LegacyFileFactory {
    writer: ItemWriter,
}

impl LegacyFileFactory {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>) -> Self {
        Self {
            writer: ItemWriter { db, storage },
        }
    }
}

#[async_trait]
impl ContentFactory for LegacyFileFactory {
    async fn create(
        &self,
        container: &containers::Model,
        type_name: &str,
        filename: &str,
        content_type: &str,
        source: ByteSource,
    ) -> Result<CreatedObject> {
        let item = self
            .writer
            .write(
                ItemDraft {
                    container,
                    portal_type: type_name,
                    schema_kind: "legacy",
                    primary_field: None,
                    filename,
                    content_type,
                },
                source,
            )
            .await?;
        Ok(CreatedObject::Legacy { item })
    }
}

/// Picks the factory for a type name: schema-based types go to
/// [`SchemaFileFactory`], everything else to [`LegacyFileFactory`].
pub struct FactoryRegistry {
    schema: Arc<dyn ContentFactory>,
    legacy: Arc<dyn ContentFactory>,
    schema_types: HashSet<String>,
}

impl FactoryRegistry {
    pub fn new(db: DatabaseConnection, storage: Arc<dyn StorageService>, config: &AppConfig) -> Self {
        Self::with_factories(
            Arc::new(SchemaFileFactory::new(db.clone(), storage.clone())),
            Arc::new(LegacyFileFactory::new(db, storage)),
            config.schema_types.iter().cloned(),
        )
    }

    pub fn with_factories(
        schema: Arc<dyn ContentFactory>,
        legacy: Arc<dyn ContentFactory>,
        schema_types: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            schema,
            legacy,
            schema_types: schema_types.into_iter().collect(),
        }
    }

    pub fn is_schema_type(&self, type_name: &str) -> bool {
        self.schema_types.contains(type_name)
    }

    pub fn select(&self, type_name: &str) -> Arc<dyn ContentFactory> {
        if self.is_schema_type(type_name) {
            self.schema.clone()
        } else {
            self.legacy.clone()
        }
    }
}
