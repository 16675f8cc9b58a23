//! Request and result types for coordinator operations.

use serde::{Deserialize, Serialize};

use timbre_core::model::{
    AssetId, CleanupCandidate, CleanupFailure, ConsistencyWarning, ContentHash, DuplicateGroup,
};
use timbre_core::schema::CatalogStats;
use timbre_core::{Error, Result};
use timbre_search::IndexStats;

/// Everything needed to admit one piece of content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmitRequest {
    pub content_hash: ContentHash,
    pub vector: Vec<f32>,
    pub size_bytes: u64,
    /// Blob store location of the payload.
    pub location: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Outcome of a successful admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "asset_id", rename_all = "snake_case")]
pub enum Admission {
    /// A new asset was catalogued and indexed.
    Admitted(AssetId),
    /// The content was already held by this asset; nothing changed.
    DuplicateOf(AssetId),
}

impl Admission {
    pub fn asset_id(self) -> AssetId {
        match self {
            Self::Admitted(id) | Self::DuplicateOf(id) => id,
        }
    }

    pub fn is_new(self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// What happened to the embedding index during a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IndexOutcome {
    /// No rebuild was needed.
    Skipped,
    Rebuilt { removed: usize, remaining: usize },
    /// The rebuild failed. The listed ids are still indexed and will be
    /// removed by the next rebuild.
    Failed {
        message: String,
        stale: Vec<AssetId>,
    },
}

/// Result of a cleanup batch, or its preview in dry-run mode.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub candidates: Vec<CleanupCandidate>,
    pub deleted_count: usize,
    pub bytes_freed: u64,
    /// Bytes the candidates would free if every deletion succeeded.
    pub estimated_bytes: u64,
    pub errors: Vec<CleanupFailure>,
    pub index: IndexOutcome,
}

impl CleanupReport {
    pub(crate) fn new(candidates: Vec<CleanupCandidate>, dry_run: bool) -> Self {
        let estimated_bytes = candidates.iter().map(|c| c.estimated_bytes_freed).sum();
        Self {
            dry_run,
            candidates,
            deleted_count: 0,
            bytes_freed: 0,
            estimated_bytes,
            errors: Vec::new(),
            index: IndexOutcome::Skipped,
        }
    }

    /// True when every candidate was deleted from every store.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && !matches!(self.index, IndexOutcome::Failed { .. })
    }

    /// Convert recorded failures into [`Error::PartialCleanupFailure`].
    pub fn into_result(self) -> Result<Self> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(Error::PartialCleanupFailure {
                attempted: self.candidates.len(),
                failures: self.errors,
            })
        }
    }
}

/// Result of resolving duplicate content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuplicateReport {
    pub groups: Vec<DuplicateGroup>,
    pub cleanup: CleanupReport,
}

/// Cross-store agreement between the catalog and the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub catalog_assets: usize,
    pub indexed_vectors: usize,
    pub warnings: Vec<ConsistencyWarning>,
    /// Set when a repair was requested.
    pub repair: Option<IndexOutcome>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// A blob location the store could not delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobFailure {
    pub location: String,
    pub message: String,
}

impl BlobFailure {
    pub fn new(location: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Result of deleting blobs that no live asset points at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanBlobReport {
    /// Orphans seen by the scan.
    pub found: usize,
    pub removed: Vec<String>,
    /// Orphans that a live asset referenced again by the time of deletion.
    pub kept: usize,
    pub failures: Vec<BlobFailure>,
}

impl OrphanBlobReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinatorStats {
    pub catalog: CatalogStats,
    pub index: IndexStats,
    pub cache_entries: usize,
    /// Indexed ids without a catalog row, waiting for an index rebuild.
    pub pending_index_removals: usize,
}
