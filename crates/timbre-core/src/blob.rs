//! Blob-store contract.
//!
//! Asset payloads live outside the catalog, addressed by the asset's
//! `location`. The coordinator only ever asks whether a payload exists and
//! asks for it to be deleted; uploads are the API layer's concern.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Storage for asset payloads.
#[async_trait]
pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Whether a payload exists at `location`.
    async fn exists(&self, location: &str) -> Result<bool>;

    /// Delete the payload at `location`. Returns `false` when there was
    /// nothing to delete.
    async fn delete(&self, location: &str) -> Result<bool>;

    /// Every location currently holding a payload.
    async fn list(&self) -> Result<Vec<String>>;
}

/// Blob store backed by a directory tree. Locations are paths relative to
/// the root.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, location: &str) -> Result<PathBuf> {
        let relative = Path::new(location);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if location.is_empty() || escapes {
            return Err(Error::InvalidData(format!(
                "blob location must be a relative path inside the store: {location:?}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, location: &str) -> Result<bool> {
        let path = self.resolve(location)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn delete(&self, location: &str) -> Result<bool> {
        let path = self.resolve(location)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if !root.exists() {
                return Vec::new();
            }
            WalkDir::new(&root)
                .follow_links(false)
                .into_iter()
                .filter_map(std::result::Result::ok)
                .filter(|entry| entry.file_type().is_file())
                .filter_map(|entry| {
                    entry
                        .path()
                        .strip_prefix(&root)
                        .ok()
                        .map(|p| p.to_string_lossy().replace('\\', "/"))
                })
                .collect()
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))
    }
}

/// In-memory blob store, for tests and for embedding the core without a
/// filesystem.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashSet<String>>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, location: impl Into<String>) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(location.into());
    }

    #[must_use]
    pub fn contains(&self, location: &str) -> bool {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(location)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn exists(&self, location: &str) -> Result<bool> {
        Ok(self.contains(location))
    }

    async fn delete(&self, location: &str) -> Result<bool> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(location))
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut locations: Vec<String> = self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        locations.sort();
        Ok(locations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_exists_and_delete() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        std::fs::write(dir.path().join("uploads/a.flac"), b"fLaC").unwrap();

        let store = FsBlobStore::new(dir.path());
        assert!(store.exists("uploads/a.flac").await.unwrap());
        assert!(store.delete("uploads/a.flac").await.unwrap());
        assert!(!store.exists("uploads/a.flac").await.unwrap());
        // Deleting again is not an error.
        assert!(!store.delete("uploads/a.flac").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_store_rejects_escaping_locations() {
        let dir = TempDir::new().unwrap();
        let store = FsBlobStore::new(dir.path());

        assert!(store.exists("../etc/passwd").await.is_err());
        assert!(store.delete("/etc/passwd").await.is_err());
        assert!(store.exists("").await.is_err());
    }

    #[tokio::test]
    async fn test_fs_store_list() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/one.mp3"), b"1").unwrap();
        std::fs::write(dir.path().join("two.wav"), b"2").unwrap();

        let store = FsBlobStore::new(dir.path());
        let mut listed = store.list().await.unwrap();
        listed.sort();
        assert_eq!(listed, vec!["a/b/one.mp3".to_string(), "two.wav".to_string()]);

        let missing = FsBlobStore::new(dir.path().join("nope"));
        assert!(missing.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryBlobStore::new();
        store.insert("x");
        assert!(store.exists("x").await.unwrap());
        assert!(store.delete("x").await.unwrap());
        assert!(!store.delete("x").await.unwrap());
        assert!(store.is_empty());
    }
}
