pub mod catalog;
pub mod migrations;

pub use catalog::{AssetCatalog, CatalogStats};
