use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::asset::Asset;
use crate::model::ids::{AssetId, ContentHash};

/// Why an asset was flagged for cleanup.
///
/// Variants are declared in evaluation order: when an asset matches several
/// criteria, the earliest variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    /// A non-canonical member of a duplicate-content group.
    Duplicate,
    /// The catalog row exists but the blob store has no payload for it.
    Orphaned,
    /// Admitted longer ago than the configured age threshold.
    Age,
}

impl fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplicate => f.write_str("duplicate"),
            Self::Orphaned => f.write_str("orphaned"),
            Self::Age => f.write_str("age"),
        }
    }
}

/// Which criteria a cleanup scan evaluates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCriteria {
    pub duplicates: bool,
    pub orphaned: bool,
    /// Matches assets whose `created_at` is further back than this.
    pub older_than: Option<Duration>,
}

impl CleanupCriteria {
    #[must_use]
    pub fn duplicates() -> Self {
        Self {
            duplicates: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn orphaned() -> Self {
        Self {
            orphaned: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn older_than(age: Duration) -> Self {
        Self {
            older_than: Some(age),
            ..Self::default()
        }
    }

    /// Combine with another set of criteria.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self {
            duplicates: self.duplicates || other.duplicates,
            orphaned: self.orphaned || other.orphaned,
            older_than: match (self.older_than, other.older_than) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.duplicates && !self.orphaned && self.older_than.is_none()
    }
}

/// An asset flagged for deletion by a cleanup scan. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupCandidate {
    pub asset_id: AssetId,
    pub content_hash: ContentHash,
    pub reason: CleanupReason,
    pub estimated_bytes_freed: u64,
}

impl CleanupCandidate {
    #[must_use]
    pub fn new(asset: &Asset, reason: CleanupReason) -> Self {
        Self {
            asset_id: asset.id,
            content_hash: asset.content_hash.clone(),
            reason,
            estimated_bytes_freed: asset.size_bytes,
        }
    }
}

/// Assets sharing one content hash.
///
/// The canonical member is the earliest created, ties broken by the
/// smallest asset id. All other members are deletion candidates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub content_hash: ContentHash,
    pub canonical: Asset,
    pub duplicates: Vec<Asset>,
}

impl DuplicateGroup {
    /// Build a group from assets sharing a hash. Returns `None` unless there
    /// are at least two members.
    #[must_use]
    pub fn from_members(mut members: Vec<Asset>) -> Option<Self> {
        if members.len() < 2 {
            return None;
        }
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let canonical = members.remove(0);
        Some(Self {
            content_hash: canonical.content_hash.clone(),
            canonical,
            duplicates: members,
        })
    }

    #[must_use]
    pub fn candidates(&self) -> Vec<CleanupCandidate> {
        self.duplicates
            .iter()
            .map(|asset| CleanupCandidate::new(asset, CleanupReason::Duplicate))
            .collect()
    }

    #[must_use]
    pub fn reclaimable_bytes(&self) -> u64 {
        self.duplicates.iter().map(|a| a.size_bytes).sum()
    }
}

/// The step of a cleanup at which a per-asset failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStage {
    Catalog,
    Index,
    Blob,
}

/// A per-asset failure captured inside a cleanup batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupFailure {
    pub asset_id: AssetId,
    pub stage: CleanupStage,
    pub message: String,
}

impl CleanupFailure {
    #[must_use]
    pub fn new(asset_id: AssetId, stage: CleanupStage, message: impl Into<String>) -> Self {
        Self {
            asset_id,
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?}): {}", self.asset_id, self.stage, self.message)
    }
}
