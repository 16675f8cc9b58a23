//! The embedding index and its rebuild-without deletion protocol.
//!
//! Concurrency model: `add` and `rebuild_without` take the exclusive lock,
//! `search` takes the shared lock. A rebuild first marks the index
//! `Rebuilding`, then waits for in-flight searches to release the lock
//! before it reads the entries. Operations arriving while the index is
//! `Rebuilding` wait behind it, or fail with [`Error::IndexBusy`] under
//! [`BusyPolicy::FailFast`].

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};

use timbre_core::model::AssetId;
use timbre_core::{Error, Result};

use crate::flat::FlatIndex;
use crate::metric::Metric;
use crate::snapshot;

/// Entries streamed between deadline checks during construction.
const DEADLINE_CHECK_INTERVAL: usize = 1024;

/// What callers experience while a rebuild is in progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Queue behind the rebuild.
    #[default]
    Wait,
    /// Return [`Error::IndexBusy`] immediately.
    FailFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexState {
    Ready,
    Rebuilding,
}

/// Construction-time settings for an [`EmbeddingIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    pub dimension: usize,
    pub metric: Metric,
    pub busy_policy: BusyPolicy,
    /// Limit on the construction step of a rebuild.
    pub rebuild_timeout: Option<Duration>,
}

impl IndexConfig {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            metric: Metric::default(),
            busy_policy: BusyPolicy::default(),
            rebuild_timeout: None,
        }
    }

    #[must_use]
    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.metric = metric;
        self
    }

    #[must_use]
    pub fn with_busy_policy(mut self, busy_policy: BusyPolicy) -> Self {
        self.busy_policy = busy_policy;
        self
    }

    #[must_use]
    pub fn with_rebuild_timeout(mut self, timeout: Duration) -> Self {
        self.rebuild_timeout = Some(timeout);
        self
    }
}

/// Outcome of a successful [`EmbeddingIndex::rebuild_without`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildSummary {
    pub removed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub vectors: usize,
    pub dimension: usize,
    pub metric: Metric,
    pub state: IndexState,
}

/// Nearest-neighbour index over fixed-dimension vectors, keyed by asset.
///
/// The index owns its vector array and id-map; nothing outside this type
/// mutates them. There is no per-entry removal: see
/// [`rebuild_without`](Self::rebuild_without).
#[derive(Debug)]
pub struct EmbeddingIndex {
    config: IndexConfig,
    inner: RwLock<Arc<FlatIndex>>,
    rebuild_gate: Mutex<()>,
    rebuilding: AtomicBool,
}

/// Holds the `Rebuilding` flag for the lifetime of a rebuild, including one
/// that is cancelled part way.
struct RebuildingFlag<'a>(&'a AtomicBool);

impl<'a> RebuildingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for RebuildingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl EmbeddingIndex {
    pub fn new(config: IndexConfig) -> Result<Self> {
        if config.dimension == 0 {
            return Err(Error::InvalidData(
                "embedding dimension must be positive".to_string(),
            ));
        }
        Ok(Self::with_entries(config, FlatIndex::new(config.dimension)))
    }

    fn with_entries(config: IndexConfig, entries: FlatIndex) -> Self {
        log::debug!(
            "Embedding index ready: {} vectors, {} dimensions, {} similarity",
            entries.len(),
            config.dimension,
            config.metric
        );
        Self {
            config,
            inner: RwLock::new(Arc::new(entries)),
            rebuild_gate: Mutex::new(()),
            rebuilding: AtomicBool::new(false),
        }
    }

    /// Load a snapshot written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        let path = path.as_ref();
        let entries = snapshot::read(path, config.dimension, config.metric)?;
        log::info!(
            "Loaded embedding index with {} vectors from {}",
            entries.len(),
            path.display()
        );
        Ok(Self::with_entries(config, entries))
    }

    /// Load a snapshot if one exists, otherwise start empty.
    pub fn load_or_new(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path, config)
        } else {
            Self::new(config)
        }
    }

    /// Write the current entries to `path`. Returns the number saved.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<usize> {
        self.check_busy()?;
        let current = Arc::clone(&*self.inner.read().await);
        let path = path.as_ref().to_path_buf();
        let (dimension, metric) = (self.config.dimension, self.config.metric);

        let saved = tokio::task::spawn_blocking(move || {
            snapshot::write(&path, &current, dimension, metric).map(|()| current.len())
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))??;
        log::info!("Saved embedding index with {} vectors", saved);
        Ok(saved)
    }

    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.config.dimension
    }

    #[must_use]
    pub const fn metric(&self) -> Metric {
        self.config.metric
    }

    #[must_use]
    pub fn state(&self) -> IndexState {
        if self.rebuilding.load(Ordering::SeqCst) {
            IndexState::Rebuilding
        } else {
            IndexState::Ready
        }
    }

    fn check_busy(&self) -> Result<()> {
        if self.config.busy_policy == BusyPolicy::FailFast
            && self.state() == IndexState::Rebuilding
        {
            return Err(Error::IndexBusy);
        }
        Ok(())
    }

    fn validate(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.config.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(Error::InvalidVector(
                "vector contains NaN or infinite components".to_string(),
            ));
        }
        Ok(())
    }

    /// Append an embedding for `asset_id`, returning its slot.
    pub async fn add(&self, asset_id: AssetId, vector: &[f32]) -> Result<usize> {
        self.validate(vector)?;
        self.check_busy()?;
        let prepared = self.config.metric.prepare(vector);

        let mut guard = self.inner.write().await;
        if guard.contains(asset_id) {
            return Err(Error::AlreadyIndexed(asset_id));
        }
        Ok(Arc::make_mut(&mut guard).push(asset_id, &prepared))
    }

    /// Up to `k` nearest entries by descending similarity, ties broken by
    /// ascending asset id.
    pub async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(AssetId, f32)>> {
        self.validate(query)?;
        self.check_busy()?;
        let prepared = self.config.metric.prepare(query);

        let guard = self.inner.read().await;
        Ok(guard.search(&prepared, k, self.config.metric))
    }

    /// The stored (prepared) vector for an asset.
    pub async fn vector(&self, asset_id: AssetId) -> Result<Option<Vec<f32>>> {
        self.check_busy()?;
        Ok(self
            .inner
            .read()
            .await
            .vector(asset_id)
            .map(<[f32]>::to_vec))
    }

    pub async fn contains(&self, asset_id: AssetId) -> bool {
        self.inner.read().await.contains(asset_id)
    }

    /// Every indexed asset id, in slot order.
    pub async fn asset_ids(&self) -> Vec<AssetId> {
        self.inner.read().await.ids().to_vec()
    }

    /// Current vector count.
    pub async fn size(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn stats(&self) -> IndexStats {
        IndexStats {
            vectors: self.size().await,
            dimension: self.config.dimension,
            metric: self.config.metric,
            state: self.state(),
        }
    }

    /// Remove entries by reconstructing the index without them.
    ///
    /// Cost is linear in the total number of vectors, so deletions must be
    /// batched into one call. Ids that are not indexed are ignored. On any
    /// failure the previous index stays in place unchanged.
    pub async fn rebuild_without(&self, asset_ids: &HashSet<AssetId>) -> Result<RebuildSummary> {
        let _gate = self.rebuild_gate.lock().await;
        let _flag = RebuildingFlag::raise(&self.rebuilding);

        // Waits for in-flight searches to finish.
        let mut guard = self.inner.write().await;
        let before = guard.len();
        let expected_removed = asset_ids.iter().filter(|id| guard.contains(**id)).count();
        if expected_removed == 0 {
            log::debug!("Rebuild skipped: none of {} ids are indexed", asset_ids.len());
            return Ok(RebuildSummary {
                removed: 0,
                remaining: before,
            });
        }

        log::info!(
            "Rebuilding embedding index without {} of {} vectors",
            expected_removed,
            before
        );
        let current = Arc::clone(&*guard);
        let excluded = asset_ids.clone();
        let dimension = self.config.dimension;
        let timeout = self.config.rebuild_timeout;

        let rebuilt = tokio::task::spawn_blocking(move || {
            construct(&current, &excluded, dimension, timeout)
        })
        .await
        .map_err(|e| Error::Task(e.to_string()))??;

        if rebuilt.len() != before - expected_removed {
            return Err(Error::InvalidData(format!(
                "rebuild produced {} vectors, expected {}",
                rebuilt.len(),
                before - expected_removed
            )));
        }

        // Swap. No await point between construction and this assignment.
        *guard = Arc::new(rebuilt);
        let summary = RebuildSummary {
            removed: expected_removed,
            remaining: guard.len(),
        };
        log::info!(
            "Rebuilt embedding index: removed {}, {} remaining",
            summary.removed,
            summary.remaining
        );
        Ok(summary)
    }
}

/// Stream the surviving entries into a fresh index, giving up once
/// `timeout` has elapsed.
fn construct(
    current: &FlatIndex,
    excluded: &HashSet<AssetId>,
    dimension: usize,
    timeout: Option<Duration>,
) -> Result<FlatIndex> {
    let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
    let mut rebuilt = FlatIndex::new(dimension);
    for (n, (id, vector)) in current
        .entries()
        .filter(|(id, _)| !excluded.contains(id))
        .enumerate()
    {
        if n % DEADLINE_CHECK_INTERVAL == 0 {
            if let Some((deadline, limit)) = deadline {
                if Instant::now() >= deadline {
                    log::warn!("Index rebuild exceeded {:?} after {} vectors", limit, n);
                    return Err(Error::RebuildTimeout(limit));
                }
            }
        }
        rebuilt.push(id, vector);
    }
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn id(n: u128) -> AssetId {
        AssetId::from_uuid(Uuid::from_u128(n))
    }

    fn ids(ns: &[u128]) -> HashSet<AssetId> {
        ns.iter().map(|&n| id(n)).collect()
    }

    async fn populated(config: IndexConfig) -> EmbeddingIndex {
        let index = EmbeddingIndex::new(config).unwrap();
        index.add(id(1), &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
        index.add(id(2), &[0.0, 1.0, 0.0, 0.0]).await.unwrap();
        index.add(id(3), &[0.9, 0.1, 0.0, 0.0]).await.unwrap();
        index
    }

    #[tokio::test]
    async fn test_add_returns_sequential_slots() {
        let index = EmbeddingIndex::new(IndexConfig::new(2)).unwrap();
        assert_eq!(index.add(id(1), &[1.0, 0.0]).await.unwrap(), 0);
        assert_eq!(index.add(id(2), &[0.0, 1.0]).await.unwrap(), 1);
        assert_eq!(index.size().await, 2);
        assert_eq!(index.state(), IndexState::Ready);
    }

    #[tokio::test]
    async fn test_add_rejects_wrong_dimension() {
        let index = EmbeddingIndex::new(IndexConfig::new(4)).unwrap();
        let err = index.add(id(1), &[1.0, 0.0, 0.0]).await.unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 4,
                actual: 3
            }
        ));
        assert_eq!(index.size().await, 0);
    }

    #[tokio::test]
    async fn test_add_rejects_non_finite_and_repeated_ids() {
        let index = EmbeddingIndex::new(IndexConfig::new(2)).unwrap();
        assert!(matches!(
            index.add(id(1), &[f32::NAN, 0.0]).await,
            Err(Error::InvalidVector(_))
        ));
        index.add(id(1), &[1.0, 0.0]).await.unwrap();
        assert!(matches!(
            index.add(id(1), &[0.0, 1.0]).await,
            Err(Error::AlreadyIndexed(_))
        ));
        assert_eq!(index.size().await, 1);
    }

    #[test]
    fn test_zero_dimension_is_rejected() {
        assert!(EmbeddingIndex::new(IndexConfig::new(0)).is_err());
    }

    #[tokio::test]
    async fn test_search_orders_nearest_first() {
        let index = populated(IndexConfig::new(4)).await;
        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        let order: Vec<AssetId> = hits.iter().map(|h| h.0).collect();
        assert_eq!(order, vec![id(1), id(3)]);
        assert!(hits[0].1 > 0.99);
        assert!(hits[0].1 >= hits[1].1);
    }

    #[tokio::test]
    async fn test_search_with_euclidean_metric() {
        let index = populated(IndexConfig::new(4).with_metric(Metric::Euclidean)).await;
        let hits = index.search(&[0.0, 1.0, 0.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].0, id(2));
        assert!((hits[0].1 - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_search_empty_and_oversized_k() {
        let index = EmbeddingIndex::new(IndexConfig::new(2)).unwrap();
        assert!(index.search(&[1.0, 0.0], 5).await.unwrap().is_empty());

        index.add(id(1), &[1.0, 0.0]).await.unwrap();
        assert_eq!(index.search(&[1.0, 0.0], 5).await.unwrap().len(), 1);
        assert!(index.search(&[1.0, 0.0, 0.0], 5).await.is_err());
    }

    #[tokio::test]
    async fn test_rebuild_without_removes_only_indexed_ids() {
        let index = populated(IndexConfig::new(4)).await;

        // id(9) was never indexed.
        let summary = index.rebuild_without(&ids(&[1, 9])).await.unwrap();
        assert_eq!(summary, RebuildSummary { removed: 1, remaining: 2 });
        assert_eq!(index.size().await, 2);
        assert!(!index.contains(id(1)).await);
        assert_eq!(index.state(), IndexState::Ready);

        let hits = index.search(&[1.0, 0.0, 0.0, 0.0], 3).await.unwrap();
        assert!(hits.iter().all(|h| h.0 != id(1)));
        assert_eq!(hits[0].0, id(3));
    }

    #[tokio::test]
    async fn test_rebuild_keeps_slot_and_id_map_in_step() {
        let index = populated(IndexConfig::new(4)).await;
        index.rebuild_without(&ids(&[2])).await.unwrap();
        assert_eq!(index.asset_ids().await, vec![id(1), id(3)]);

        // New entries append after the compacted slots.
        assert_eq!(index.add(id(4), &[0.0, 0.0, 1.0, 0.0]).await.unwrap(), 2);
        assert_eq!(index.vector(id(3)).await.unwrap().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_rebuild_with_nothing_indexed_is_a_no_op() {
        let index = populated(IndexConfig::new(4)).await;
        let summary = index.rebuild_without(&ids(&[42])).await.unwrap();
        assert_eq!(summary, RebuildSummary { removed: 0, remaining: 3 });
        let summary = index.rebuild_without(&HashSet::new()).await.unwrap();
        assert_eq!(summary.removed, 0);
    }

    #[tokio::test]
    async fn test_rebuild_timeout_leaves_index_untouched() {
        let index = populated(IndexConfig::new(4).with_rebuild_timeout(Duration::ZERO)).await;
        let err = index.rebuild_without(&ids(&[1, 2])).await.unwrap_err();
        assert!(matches!(err, Error::RebuildTimeout(_)));
        assert_eq!(index.size().await, 3);
        assert!(index.contains(id(1)).await);
        assert_eq!(index.state(), IndexState::Ready);
    }

    #[tokio::test]
    async fn test_rebuild_waits_for_active_readers() {
        let index = Arc::new(populated(IndexConfig::new(4)).await);
        let reader = index.inner.read().await;

        let rebuild = tokio::spawn({
            let index = Arc::clone(&index);
            async move { index.rebuild_without(&ids(&[1])).await }
        });
        while index.state() != IndexState::Rebuilding {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }

        // The reader still sees the old structure; the rebuild is parked.
        assert_eq!(reader.len(), 3);
        assert!(!rebuild.is_finished());

        drop(reader);
        let summary = rebuild.await.unwrap().unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(index.size().await, 2);
        assert_eq!(index.state(), IndexState::Ready);
    }

    #[tokio::test]
    async fn test_fail_fast_policy_reports_busy_during_rebuild() {
        let config = IndexConfig::new(4).with_busy_policy(BusyPolicy::FailFast);
        let index = Arc::new(populated(config).await);
        let reader = index.inner.read().await;

        let rebuild = tokio::spawn({
            let index = Arc::clone(&index);
            async move { index.rebuild_without(&ids(&[2])).await }
        });
        while index.state() != IndexState::Rebuilding {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0, 0.0], 1).await,
            Err(Error::IndexBusy)
        ));
        assert!(matches!(
            index.add(id(7), &[0.0, 0.0, 0.0, 1.0]).await,
            Err(Error::IndexBusy)
        ));

        drop(reader);
        rebuild.await.unwrap().unwrap();
        assert_eq!(index.search(&[1.0, 0.0, 0.0, 0.0], 1).await.unwrap()[0].0, id(1));
    }

    #[tokio::test]
    async fn test_cancelled_rebuild_resets_state() {
        let index = Arc::new(populated(IndexConfig::new(4)).await);
        let reader = index.inner.read().await;

        let rebuild = tokio::spawn({
            let index = Arc::clone(&index);
            async move { index.rebuild_without(&ids(&[1])).await }
        });
        while index.state() != IndexState::Rebuilding {
            tokio::task::yield_now().await;
        }
        rebuild.abort();
        assert!(rebuild.await.unwrap_err().is_cancelled());
        drop(reader);

        assert_eq!(index.state(), IndexState::Ready);
        assert_eq!(index.size().await, 3);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index/embeddings.json.gz");
        let config = IndexConfig::new(4);

        let index = populated(config).await;
        assert_eq!(index.save(&path).await.unwrap(), 3);

        let loaded = EmbeddingIndex::load(&path, config).unwrap();
        assert_eq!(loaded.size().await, 3);
        assert_eq!(loaded.asset_ids().await, index.asset_ids().await);
        let hits = loaded.search(&[1.0, 0.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(hits[0].0, id(1));
        assert_eq!(hits[1].0, id(3));
    }

    #[tokio::test]
    async fn test_load_rejects_mismatched_configuration() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("embeddings.json.gz");
        populated(IndexConfig::new(4)).await.save(&path).await.unwrap();

        assert!(matches!(
            EmbeddingIndex::load(&path, IndexConfig::new(8)),
            Err(Error::DimensionMismatch { .. })
        ));
        assert!(EmbeddingIndex::load(&path, IndexConfig::new(4).with_metric(Metric::Euclidean))
            .is_err());
    }

    #[tokio::test]
    async fn test_load_or_new_without_snapshot() {
        let dir = TempDir::new().unwrap();
        let index =
            EmbeddingIndex::load_or_new(dir.path().join("missing.json.gz"), IndexConfig::new(3))
                .unwrap();
        assert_eq!(index.size().await, 0);
    }
}
