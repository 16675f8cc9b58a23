//! Vector search for timbre.
//!
//! Maintains an exact nearest-neighbour index over content embeddings,
//! keyed by asset id. The index has no in-place removal: entries leave only
//! through [`EmbeddingIndex::rebuild_without`], which reconstructs the index
//! from the surviving entries and swaps it in.

#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]

mod flat;
pub mod index;
pub mod metric;
mod snapshot;

pub use index::{BusyPolicy, EmbeddingIndex, IndexConfig, IndexState, IndexStats, RebuildSummary};
pub use metric::Metric;
