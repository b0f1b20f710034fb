use super::{ContainerResolver, WorkflowTool};
use crate::entities::{containers, prelude::*};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const FOLDER_TYPE: &str = "Folder";

/// Inserts a container below `parent` (or a root container when `None`).
pub async fn insert_container(
    db: &impl ConnectionTrait,
    parent: Option<&containers::Model>,
    name: &str,
    allow_subfolders: bool,
) -> Result<containers::Model> {
    let path = match parent {
        Some(p) if !p.path.is_empty() => format!("{}/{}", p.path, name),
        Some(_) => name.to_string(),
        None => String::new(),
    };

    let container = containers::ActiveModel {
        id: Set(Uuid::new_v4().to_string()),
        parent_id: Set(parent.map(|p| p.id.clone())),
        name: Set(name.to_string()),
        path: Set(path),
        portal_type: Set(FOLDER_TYPE.to_string()),
        allow_subfolders: Set(allow_subfolders),
        review_state: Set("private".to_string()),
        created_at: Set(Utc::now().into()),
    };

    Ok(container.insert(db).await?)
}

/// Resolves uploads into a conventionally named folder ("images") next to
/// or below the context, creating it where the repository allows.
pub struct RepositoryContainerResolver {
    db: DatabaseConnection,
    workflow: Arc<dyn WorkflowTool>,
    folder_name: String,
}

impl RepositoryContainerResolver {
    pub fn new(
        db: DatabaseConnection,
        workflow: Arc<dyn WorkflowTool>,
        folder_name: impl Into<String>,
    ) -> Self {
        Self {
            db,
            workflow,
            folder_name: folder_name.into(),
        }
    }

    async fn child_folder(&self, parent: &containers::Model) -> Result<Option<containers::Model>> {
        Ok(Containers::find()
            .filter(containers::Column::ParentId.eq(&parent.id))
            .filter(containers::Column::Name.eq(&self.folder_name))
            .one(&self.db)
            .await?)
    }

    async fn create_folder(&self, parent: &containers::Model) -> Result<containers::Model> {
        if !parent.allow_subfolders {
            return Err(anyhow!(
                "folders may not be created in {:?}",
                parent.path
            ));
        }

        let name_taken = ContentItems::find()
            .filter(crate::entities::content_items::Column::ContainerId.eq(&parent.id))
            .filter(crate::entities::content_items::Column::Name.eq(&self.folder_name))
            .one(&self.db)
            .await?
            .is_some();
        if name_taken {
            return Err(anyhow!(
                "{:?} already holds an item named {}",
                parent.path,
                self.folder_name
            ));
        }

        insert_container(&self.db, Some(parent), &self.folder_name, true).await
    }
}

#[async_trait]
impl ContainerResolver for RepositoryContainerResolver {
    async fn resolve(&self, context: &containers::Model) -> Result<containers::Model> {
        if context.name == self.folder_name {
            return Ok(context.clone());
        }

        let parent = match &context.parent_id {
            Some(id) => Containers::find_by_id(id).one(&self.db).await?,
            None => None,
        };

        for item in std::iter::once(context).chain(parent.as_ref()) {
            if let Some(existing) = self.child_folder(item).await? {
                return Ok(existing);
            }

            let folder = match self.create_folder(item).await {
                Ok(folder) => folder,
                Err(e) => {
                    debug!("Cannot create {} folder here, trying parent: {}", self.folder_name, e);
                    continue;
                }
            };
            info!("📁 Created {} folder at {:?}", self.folder_name, folder.path);

            // Publishing is best effort; an unpublished folder still works.
            if let Err(e) = self.workflow.publish(&folder).await {
                warn!("Failed to publish {:?}: {}", folder.path, e);
                return Ok(folder);
            }

            return Ok(Containers::find_by_id(&folder.id)
                .one(&self.db)
                .await?
                .unwrap_or(folder));
        }

        Ok(context.clone())
    }
}

/// Minimal workflow: publishing flips `review_state`.
pub struct RepositoryWorkflow {
    db: DatabaseConnection,
}

impl RepositoryWorkflow {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl WorkflowTool for RepositoryWorkflow {
    async fn publish(&self, container: &containers::Model) -> Result<()> {
        let mut active: containers::ActiveModel = container.clone().into();
        active.review_state = Set("published".to_string());
        active.update(&self.db).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::database::run_migrations;
    use sea_orm::Database;

    struct FailingWorkflow;

    #[async_trait]
    impl WorkflowTool for FailingWorkflow {
        async fn publish(&self, _container: &containers::Model) -> Result<()> {
            Err(anyhow!("workflow offline"))
        }
    }

    async fn setup_db() -> DatabaseConnection {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        run_migrations(&db).await.unwrap();
        db
    }

    fn resolver(db: &DatabaseConnection) -> RepositoryContainerResolver {
        RepositoryContainerResolver::new(
            db.clone(),
            Arc::new(RepositoryWorkflow::new(db.clone())),
            "images",
        )
    }

    #[tokio::test]
    async fn test_creates_and_publishes_images_folder() {
        let db = setup_db().await;
        let root = insert_container(&db, None, "portal", true).await.unwrap();
        let news = insert_container(&db, Some(&root), "news", true).await.unwrap();

        let target = resolver(&db).resolve(&news).await.unwrap();
        assert_eq!(target.name, "images");
        assert_eq!(target.path, "news/images");
        assert_eq!(target.parent_id.as_deref(), Some(news.id.as_str()));
        assert_eq!(target.review_state, "published");

        // Second upload reuses the folder.
        let again = resolver(&db).resolve(&news).await.unwrap();
        assert_eq!(again.id, target.id);
    }

    #[tokio::test]
    async fn test_images_context_is_used_as_is() {
        let db = setup_db().await;
        let root = insert_container(&db, None, "portal", true).await.unwrap();
        let images = insert_container(&db, Some(&root), "images", true).await.unwrap();

        let target = resolver(&db).resolve(&images).await.unwrap();
        assert_eq!(target.id, images.id);
    }

    #[tokio::test]
    async fn test_falls_back_to_parent_then_context() {
        let db = setup_db().await;
        let root = insert_container(&db, None, "portal", true).await.unwrap();
        let locked = insert_container(&db, Some(&root), "locked", false).await.unwrap();

        let target = resolver(&db).resolve(&locked).await.unwrap();
        assert_eq!(target.path, "images");
        assert_eq!(target.parent_id.as_deref(), Some(root.id.as_str()));

        let sealed_root = insert_container(&db, None, "sealed", false).await.unwrap();
        let sealed_child = insert_container(&db, Some(&sealed_root), "child", false)
            .await
            .unwrap();
        let target = resolver(&db).resolve(&sealed_child).await.unwrap();
        assert_eq!(target.id, sealed_child.id);
    }

    #[tokio::test]
    async fn test_publish_failure_is_ignored() {
        let db = setup_db().await;
        let root = insert_container(&db, None, "portal", true).await.unwrap();
        let resolver =
            RepositoryContainerResolver::new(db.clone(), Arc::new(FailingWorkflow), "images");

        let target = resolver.resolve(&root).await.unwrap();
        assert_eq!(target.name, "images");
        assert_eq!(target.review_state, "private");
    }
}
