pub mod prelude;

pub mod containers;
pub mod content_items;
