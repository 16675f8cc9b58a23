use std::time::Duration;

use thiserror::Error;

use crate::model::{AssetId, CleanupFailure, ContentHash};

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Admission of content whose hash is already held by a live asset.
    #[error("content {hash} is already catalogued as asset {existing}")]
    DuplicateContent {
        hash: ContentHash,
        existing: AssetId,
    },

    #[error("vector has {actual} dimensions, index expects {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid vector: {0}")]
    InvalidVector(String),

    #[error("not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    /// The embedding index is rebuilding and the fail-fast policy is active.
    #[error("embedding index is busy rebuilding")]
    IndexBusy,

    #[error("asset {0} already has an embedding")]
    AlreadyIndexed(AssetId),

    #[error("index rebuild did not finish within {0:?}")]
    RebuildTimeout(Duration),

    /// Aggregate of per-asset failures from a cleanup batch.
    #[error("{} of {attempted} cleanup candidates failed", failures.len())]
    PartialCleanupFailure {
        attempted: usize,
        failures: Vec<CleanupFailure>,
    },

    /// An admission failed and the compensating catalog delete failed too.
    /// The named asset exists in the catalog without an embedding.
    #[error("asset {asset_id} left inconsistent: {cause}; compensation failed: {compensation}")]
    CompensationFailed {
        asset_id: AssetId,
        cause: Box<Error>,
        compensation: Box<Error>,
    },

    #[error("background task failed: {0}")]
    Task(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Returns `true` when the error is transient and the operation may
    /// succeed if retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Returns `true` when the error indicates the entity was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub(crate) fn asset_not_found(id: AssetId) -> Self {
        Self::NotFound {
            entity: "asset",
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
