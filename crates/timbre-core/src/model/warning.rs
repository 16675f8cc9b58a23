use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::ids::AssetId;

/// A non-fatal disagreement between stores.
///
/// These are logged rather than raised: the operation that observed them
/// still completes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyWarning {
    /// The index returned an asset the catalog no longer holds.
    VanishedAsset { asset_id: AssetId },
    /// A catalogued asset has no embedding.
    MissingEmbedding { asset_id: AssetId },
    /// The index holds an embedding for an asset the catalog does not.
    DanglingEmbedding { asset_id: AssetId },
    /// The blob store holds a payload no catalog row points at.
    OrphanBlob { location: String },
}

impl fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VanishedAsset { asset_id } => {
                write!(f, "search hit {asset_id} is not in the catalog")
            }
            Self::MissingEmbedding { asset_id } => {
                write!(f, "asset {asset_id} has no embedding")
            }
            Self::DanglingEmbedding { asset_id } => {
                write!(f, "embedding for {asset_id} has no catalog row")
            }
            Self::OrphanBlob { location } => {
                write!(f, "blob {location} has no catalog row")
            }
        }
    }
}
