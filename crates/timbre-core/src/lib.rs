//! Core domain model for timbre.
//!
//! This crate defines the asset model, the SQLite-backed asset catalog, the
//! hash-keyed content cache, and the blob-store contract that the
//! consistency coordinator drives.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod blob;
pub mod cache;
pub mod error;
pub mod model;
pub mod schema;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use cache::ContentCache;
pub use error::{Error, Result};
pub use schema::AssetCatalog;
