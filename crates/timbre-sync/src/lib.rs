//! Cross-store consistency for timbre.
//!
//! The [`ConsistencyCoordinator`] is the only writer of the asset catalog,
//! the embedding index, the content cache and the blob store. It sequences
//! admission and cleanup so that the four stores agree about which assets
//! exist once each operation returns.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod coordinator;
pub mod report;

pub use config::Config;
pub use coordinator::ConsistencyCoordinator;
pub use report::{
    Admission, AdmitRequest, BlobFailure, CleanupReport, ConsistencyReport, CoordinatorStats,
    DuplicateReport, IndexOutcome, OrphanBlobReport,
};
