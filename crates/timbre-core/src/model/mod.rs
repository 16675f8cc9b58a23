pub mod asset;
pub mod cleanup;
pub mod ids;
pub mod warning;

pub use asset::{Asset, AssetSummary};
pub use cleanup::{
    CleanupCandidate, CleanupCriteria, CleanupFailure, CleanupReason, CleanupStage,
    DuplicateGroup,
};
pub use ids::{AssetId, ContentHash};
pub use warning::ConsistencyWarning;
