use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "content_items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub uid: String,
    pub container_id: String,
    pub name: String,
    pub portal_type: String,
    /// "schema" or "legacy", the factory that created the item
    pub schema_kind: String,
    /// For schema items: the field holding the blob ("file" or "image")
    pub primary_field: Option<String>,
    pub filename: String,
    pub content_type: String,
    pub size: i64,
    pub blob_key: String,
    pub hash: String,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::containers::Entity",
        from = "Column::ContainerId",
        to = "super::containers::Column::Id",
        on_update = "NoAction",
        on_delete = "Cascade"
    )]
    Containers,
}

impl Related<super::containers::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Containers.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
