//! Collaborators the dispatcher hands finished uploads to: container
//! resolution, content factories and identity lookup.

pub mod container;
pub mod factory;

use crate::entities::{containers, content_items};
use crate::services::session_store::ByteSource;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

pub use container::{RepositoryContainerResolver, RepositoryWorkflow, insert_container};
pub use factory::{FactoryRegistry, LegacyFileFactory, SchemaFileFactory, find_type_name};

/// A blob-bearing field of a schema-based item.
#[derive(Debug, Clone, Serialize)]
pub struct BlobField {
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub blob_key: String,
}

impl BlobField {
    pub fn get_size(&self) -> i64 {
        self.size
    }
}

/// An item created by one of the content factories.
#[derive(Debug, Clone)]
pub enum CreatedObject {
    /// Schema-based item; its data lives in a `file` or `image` sub-field
    Schema {
        item: content_items::Model,
        file: Option<BlobField>,
        image: Option<BlobField>,
    },
    /// Legacy item exposing size and content type directly
    Legacy { item: content_items::Model },
}

impl CreatedObject {
    pub fn item(&self) -> &content_items::Model {
        match self {
            Self::Schema { item, .. } | Self::Legacy { item } => item,
        }
    }

    /// Size and content type as the object itself reports them.
    pub fn size_and_type(&self) -> (i64, String) {
        match self {
            Self::Schema { item, file, image } => {
                let field = if item.portal_type.contains("File") {
                    file.as_ref()
                } else if item.portal_type.contains("Image") {
                    image.as_ref()
                } else {
                    file.as_ref().or(image.as_ref())
                };
                match field {
                    Some(blob) => (blob.get_size(), blob.content_type.clone()),
                    None => (item.size, item.content_type.clone()),
                }
            }
            Self::Legacy { item } => (item.size, item.content_type.clone()),
        }
    }
}

/// Finds (or creates) the container an upload should land in.
#[async_trait]
pub trait ContainerResolver: Send + Sync {
    async fn resolve(&self, context: &containers::Model) -> Result<containers::Model>;
}

/// Publishes newly created containers.
#[async_trait]
pub trait WorkflowTool: Send + Sync {
    async fn publish(&self, container: &containers::Model) -> Result<()>;
}

/// Creates a content item of `type_name` from an uploaded file.
#[async_trait]
pub trait ContentFactory: Send + Sync {
    async fn create(
        &self,
        container: &containers::Model,
        type_name: &str,
        filename: &str,
        content_type: &str,
        source: ByteSource,
    ) -> Result<CreatedObject>;
}

/// Returns the globally unique identifier of a created object.
pub trait IdentityResolver: Send + Sync {
    fn uid(&self, object: &CreatedObject) -> Result<String>;
}

/// Reads the UID stored on the item row.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemUid;

impl IdentityResolver for ItemUid {
    fn uid(&self, object: &CreatedObject) -> Result<String> {
        let uid = &object.item().uid;
        if uid.is_empty() {
            anyhow::bail!("object {} has no UID", object.item().name);
        }
        Ok(uid.clone())
    }
}

/// Public URL of an object in a container.
pub fn absolute_url(portal_url: &str, container_path: &str, name: &str) -> String {
    let mut url = portal_url.trim_end_matches('/').to_string();
    for segment in container_path.split('/').filter(|s| !s.is_empty()) {
        url.push('/');
        url.push_str(segment);
    }
    url.push('/');
    url.push_str(name);
    url
}
