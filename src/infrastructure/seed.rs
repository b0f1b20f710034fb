use crate::entities::{containers, prelude::*};
use crate::services::content::insert_container;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tracing::info;

pub const ROOT_CONTAINER_NAME: &str = "portal";

/// Makes sure the site root exists; uploads address containers below it.
pub async fn seed_root_container(db: &DatabaseConnection) -> anyhow::Result<containers::Model> {
    if let Some(root) = Containers::find()
        .filter(containers::Column::ParentId.is_null())
        .filter(containers::Column::Name.eq(ROOT_CONTAINER_NAME))
        .one(db)
        .await?
    {
        return Ok(root);
    }

    info!("🌱 Seeding root container...");
    let root = insert_container(db, None, ROOT_CONTAINER_NAME, true).await?;
    info!("✅ Root container {} created", root.id);
    Ok(root)
}
