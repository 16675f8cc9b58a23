use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ids::{AssetId, ContentHash};

/// A unique piece of uploaded content, tracked by its content hash.
///
/// `id` and `content_hash` never change once the asset is catalogued. The
/// remaining fields are updated by metadata operations on the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: AssetId,

    pub content_hash: ContentHash,

    /// Size of the backing blob in bytes.
    pub size_bytes: u64,

    /// Where the blob store keeps the payload.
    pub location: String,

    pub created_at: DateTime<Utc>,

    /// Last time a caller fetched this asset. Age-based cleanup is measured
    /// from here.
    pub last_accessed_at: DateTime<Utc>,

    pub tags: Vec<String>,
}

impl Asset {
    #[must_use]
    pub fn new(content_hash: ContentHash, size_bytes: u64, location: impl Into<String>) -> Self {
        // The catalog stores microsecond precision.
        let now = Utc::now().trunc_subsecs(6);
        Self {
            id: AssetId::new(),
            content_hash,
            size_bytes,
            location: location.into(),
            created_at: now,
            last_accessed_at: now,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Backdate the asset, e.g. when importing records from an older store.
    #[must_use]
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        let created_at = created_at.trunc_subsecs(6);
        self.created_at = created_at;
        self.last_accessed_at = created_at;
        self
    }
}

/// A similarity hit enriched with catalog metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetSummary {
    pub asset_id: AssetId,
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub location: String,
    pub tags: Vec<String>,
    pub similarity: f32,
}

impl AssetSummary {
    #[must_use]
    pub fn from_hit(asset: Asset, similarity: f32) -> Self {
        Self {
            asset_id: asset.id,
            content_hash: asset.content_hash,
            size_bytes: asset.size_bytes,
            location: asset.location,
            tags: asset.tags,
            similarity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_asset_new() {
        let asset = Asset::new(ContentHash::from("abc"), 2048, "uploads/a.flac");
        assert_eq!(asset.size_bytes, 2048);
        assert_eq!(asset.location, "uploads/a.flac");
        assert_eq!(asset.created_at, asset.last_accessed_at);
        assert!(asset.tags.is_empty());
    }

    #[test]
    fn test_asset_with_created_at_resets_access_time() {
        let past = (Utc::now() - Duration::days(40)).trunc_subsecs(6);
        let asset = Asset::new(ContentHash::from("abc"), 1, "a").with_created_at(past);
        assert_eq!(asset.created_at, past);
        assert_eq!(asset.last_accessed_at, past);
    }

    #[test]
    fn test_summary_from_hit() {
        let asset = Asset::new(ContentHash::from("abc"), 7, "a.mp3")
            .with_tags(vec!["jazz".to_string()]);
        let id = asset.id;
        let summary = AssetSummary::from_hit(asset, 0.5);
        assert_eq!(summary.asset_id, id);
        assert_eq!(summary.tags, vec!["jazz".to_string()]);
        assert!((summary.similarity - 0.5).abs() < f32::EPSILON);
    }
}
