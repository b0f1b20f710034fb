pub use super::containers::Entity as Containers;
pub use super::content_items::Entity as ContentItems;
