//! Sequencing of multi-store operations.
//!
//! Every write that touches more than one store goes through
//! [`ConsistencyCoordinator`]. Admission writes the catalog first and the
//! index second, deleting the catalog row again if indexing fails. Cleanup
//! deletes catalog rows one at a time, invalidates the cache, then removes
//! every deleted asset from the index with a single rebuild before touching
//! blobs.
//!
//! `admit` and the executing half of cleanup run on a spawned task, so a
//! caller that stops polling does not leave a half-finished batch behind.
//!
//! Deleted assets whose index removal failed are not tracked separately:
//! they are exactly the indexed ids without a catalog row, so every rebuild
//! recomputes them and a restarted process picks them up as well.

use backon::{ExponentialBuilder, Retryable};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use timbre_core::model::{
    Asset, AssetId, AssetSummary, CleanupCandidate, CleanupCriteria, CleanupFailure,
    CleanupStage, ConsistencyWarning, DuplicateGroup,
};
use timbre_core::{AssetCatalog, BlobStore, ContentCache, Error, Result};
use timbre_search::EmbeddingIndex;

use crate::report::{
    Admission, AdmitRequest, BlobFailure, CleanupReport, ConsistencyReport, CoordinatorStats,
    DuplicateReport, IndexOutcome, OrphanBlobReport,
};

const DEFAULT_BLOB_RETRIES: usize = 3;
const DEFAULT_BLOB_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Owns the four stores and keeps them in agreement.
///
/// Cloning is cheap; clones share the same stores.
#[derive(Debug, Clone)]
pub struct ConsistencyCoordinator {
    catalog: Arc<AssetCatalog>,
    index: Arc<EmbeddingIndex>,
    cache: Arc<ContentCache>,
    blobs: Arc<dyn BlobStore>,
    blob_retries: usize,
    blob_retry_delay: Duration,
}

impl ConsistencyCoordinator {
    pub fn new(
        catalog: Arc<AssetCatalog>,
        index: Arc<EmbeddingIndex>,
        cache: Arc<ContentCache>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            catalog,
            index,
            cache,
            blobs,
            blob_retries: DEFAULT_BLOB_RETRIES,
            blob_retry_delay: DEFAULT_BLOB_RETRY_DELAY,
        }
    }

    /// Configure retries for transient blob-store failures during cleanup.
    #[must_use]
    pub fn with_blob_retry(mut self, retries: usize, min_delay: Duration) -> Self {
        self.blob_retries = retries;
        self.blob_retry_delay = min_delay;
        self
    }

    pub fn catalog(&self) -> &AssetCatalog {
        &self.catalog
    }

    pub fn index(&self) -> &EmbeddingIndex {
        &self.index
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    /// Indexed ids with no catalog row.
    ///
    /// The index is read first: admission inserts the catalog row before
    /// indexing, so an id seen in the index is either still catalogued or
    /// really deleted by the time the catalog is read.
    async fn dangling_ids(&self) -> Result<Vec<AssetId>> {
        let indexed = self.index.asset_ids().await;
        let catalogued: HashSet<AssetId> = self.catalog.list_ids()?.into_iter().collect();
        let mut dangling: Vec<AssetId> = indexed
            .into_iter()
            .filter(|id| !catalogued.contains(id))
            .collect();
        dangling.sort_unstable();
        Ok(dangling)
    }
}

// Admission
impl ConsistencyCoordinator {
    /// Admit content, or report the live asset already holding it.
    ///
    /// On success the asset is present in both the catalog and the index.
    /// On failure neither store holds it, unless the error is
    /// [`Error::CompensationFailed`].
    pub async fn admit(&self, request: AdmitRequest) -> Result<Admission> {
        let this = self.clone();
        tokio::spawn(async move { this.admit_inner(request).await })
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn admit_inner(&self, request: AdmitRequest) -> Result<Admission> {
        if let Some(existing) = self.catalog.find_by_hash(&request.content_hash)? {
            log::debug!(
                "Content {} already held by {}",
                request.content_hash.short(),
                existing.id
            );
            return Ok(Admission::DuplicateOf(existing.id));
        }

        let AdmitRequest {
            content_hash,
            vector,
            size_bytes,
            location,
            tags,
        } = request;
        let asset = Asset::new(content_hash, size_bytes, location).with_tags(tags);

        let asset_id = match self.catalog.insert(&asset) {
            Ok(id) => id,
            // Lost a race with a concurrent admission of the same content.
            Err(Error::DuplicateContent { existing, .. }) => {
                return Ok(Admission::DuplicateOf(existing));
            }
            Err(e) => return Err(e),
        };

        if let Err(cause) = self.index.add(asset_id, &vector).await {
            return Err(self.compensate_admission(asset_id, cause));
        }

        log::info!(
            "Admitted asset {} ({}, {} bytes)",
            asset_id,
            asset.content_hash.short(),
            asset.size_bytes
        );
        Ok(Admission::Admitted(asset_id))
    }

    fn compensate_admission(&self, asset_id: AssetId, cause: Error) -> Error {
        log::warn!("Indexing {} failed, removing catalog row: {}", asset_id, cause);
        match self.catalog.delete(asset_id) {
            Ok(_) => cause,
            Err(compensation) => {
                log::error!(
                    "Asset {} is catalogued without an embedding: {}",
                    asset_id,
                    compensation
                );
                Error::CompensationFailed {
                    asset_id,
                    cause: Box::new(cause),
                    compensation: Box::new(compensation),
                }
            }
        }
    }
}

// Queries
impl ConsistencyCoordinator {
    /// Nearest live assets to `vector`, best first.
    ///
    /// Hits whose asset has left the catalog are dropped with a warning and
    /// the search widens to fill their place, so fewer than `k` results come
    /// back only when fewer than `k` live assets are indexed.
    pub async fn query_similar(&self, vector: &[f32], k: usize) -> Result<Vec<AssetSummary>> {
        self.ranked(vector, k, None, &[]).await
    }

    /// Like [`query_similar`](Self::query_similar), keeping only assets that
    /// carry every one of `tags`.
    pub async fn query_similar_tagged(
        &self,
        vector: &[f32],
        k: usize,
        tags: &[String],
    ) -> Result<Vec<AssetSummary>> {
        self.ranked(vector, k, None, tags).await
    }

    /// Nearest live assets to an already-indexed asset, excluding itself.
    pub async fn find_similar(&self, asset_id: AssetId, k: usize) -> Result<Vec<AssetSummary>> {
        let vector = self
            .index
            .vector(asset_id)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "embedding",
                id: asset_id.to_string(),
            })?;
        self.ranked(&vector, k, Some(asset_id), &[]).await
    }

    /// Search with a fetch of `2k`, doubling it until `k` hits survive
    /// enrichment or the index has nothing more to return.
    async fn ranked(
        &self,
        vector: &[f32],
        k: usize,
        exclude: Option<AssetId>,
        tags: &[String],
    ) -> Result<Vec<AssetSummary>> {
        let mut fetch = k.saturating_mul(2);
        loop {
            let hits = self.index.search(vector, fetch).await?;
            let exhausted = hits.len() < fetch;
            let (mut summaries, vanished) = self.enrich(hits, exclude, tags)?;
            if summaries.len() >= k || exhausted {
                for asset_id in vanished {
                    log::warn!("{}", ConsistencyWarning::VanishedAsset { asset_id });
                }
                summaries.truncate(k);
                return Ok(summaries);
            }
            log::debug!(
                "{} of {} hits usable, widening search to {}",
                summaries.len(),
                fetch,
                fetch.saturating_mul(2)
            );
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Attach catalog rows to hits. Returns the summaries that pass the
    /// filters and the ids that have no catalog row.
    fn enrich(
        &self,
        hits: Vec<(AssetId, f32)>,
        exclude: Option<AssetId>,
        tags: &[String],
    ) -> Result<(Vec<AssetSummary>, Vec<AssetId>)> {
        let mut summaries = Vec::with_capacity(hits.len());
        let mut vanished = Vec::new();
        for (asset_id, similarity) in hits {
            if exclude == Some(asset_id) {
                continue;
            }
            match self.catalog.get(asset_id)? {
                Some(asset) if tags.iter().all(|tag| asset.tags.contains(tag)) => {
                    summaries.push(AssetSummary::from_hit(asset, similarity));
                }
                Some(_) => {}
                None => vanished.push(asset_id),
            }
        }
        Ok((summaries, vanished))
    }

    /// Fetch an asset and mark it as accessed.
    pub fn get_asset(&self, asset_id: AssetId) -> Result<Asset> {
        self.catalog.record_access(asset_id)?;
        self.catalog.get(asset_id)?.ok_or_else(|| Error::NotFound {
            entity: "asset",
            id: asset_id.to_string(),
        })
    }

    pub async fn stats(&self) -> Result<CoordinatorStats> {
        Ok(CoordinatorStats {
            catalog: self.catalog.stats()?,
            index: self.index.stats().await,
            cache_entries: self.cache.len(),
            pending_index_removals: self.dangling_ids().await?.len(),
        })
    }

    /// Persist the embedding index, returning the number of vectors written.
    pub async fn checkpoint(&self, path: impl AsRef<Path>) -> Result<usize> {
        let written = self.index.save(path.as_ref()).await?;
        log::info!("Saved {} vectors to {}", written, path.as_ref().display());
        Ok(written)
    }
}

// Cleanup
impl ConsistencyCoordinator {
    /// Remove every asset matching `criteria` from all stores.
    ///
    /// With `dry_run` the candidates are listed and nothing is mutated.
    /// Per-asset failures are recorded in the report and do not stop the
    /// batch; the returned error is reserved for failures that prevent the
    /// batch from starting.
    pub async fn cleanup(&self, criteria: CleanupCriteria, dry_run: bool) -> Result<CleanupReport> {
        let candidates = self
            .catalog
            .list_candidates(&criteria, self.blobs.as_ref())
            .await?;
        log::info!(
            "Found {} cleanup candidates{}",
            candidates.len(),
            if dry_run { " (dry run)" } else { "" }
        );
        if dry_run {
            return Ok(CleanupReport::new(candidates, true));
        }
        self.run_batch(candidates).await
    }

    /// Delete every non-canonical member of each duplicate group.
    ///
    /// The canonical member of a group is its earliest-created asset.
    pub async fn resolve_duplicates(&self, dry_run: bool) -> Result<DuplicateReport> {
        let groups = self.catalog.duplicate_groups()?;
        let candidates: Vec<CleanupCandidate> =
            groups.iter().flat_map(DuplicateGroup::candidates).collect();
        log::info!(
            "Found {} duplicate groups ({} redundant assets)",
            groups.len(),
            candidates.len()
        );
        let cleanup = if dry_run {
            CleanupReport::new(candidates, true)
        } else {
            self.run_batch(candidates).await?
        };
        Ok(DuplicateReport { groups, cleanup })
    }

    async fn run_batch(&self, candidates: Vec<CleanupCandidate>) -> Result<CleanupReport> {
        let this = self.clone();
        tokio::spawn(async move { this.execute_batch(candidates).await })
            .await
            .map_err(|e| Error::Task(e.to_string()))
    }

    async fn execute_batch(&self, candidates: Vec<CleanupCandidate>) -> CleanupReport {
        let mut report = CleanupReport::new(candidates, false);
        let mut deleted = Vec::with_capacity(report.candidates.len());

        for candidate in &report.candidates {
            match self.catalog.delete(candidate.asset_id) {
                Ok(asset) => {
                    log::debug!("Deleted {} ({})", asset.id, candidate.reason);
                    self.invalidate_cache(&asset);
                    deleted.push(asset);
                }
                Err(e) => {
                    log::warn!("Could not delete {}: {}", candidate.asset_id, e);
                    report.errors.push(CleanupFailure::new(
                        candidate.asset_id,
                        CleanupStage::Catalog,
                        e.to_string(),
                    ));
                }
            }
        }
        report.deleted_count = deleted.len();
        report.bytes_freed = deleted.iter().map(|a| a.size_bytes).sum();

        report.index = self.remove_from_index(deleted.iter().map(|a| a.id)).await;
        if let IndexOutcome::Failed { message, stale } = &report.index {
            report.errors.extend(
                stale
                    .iter()
                    .map(|&id| CleanupFailure::new(id, CleanupStage::Index, message.clone())),
            );
        }

        for asset in &deleted {
            if let Err(failure) = self.delete_blob(asset).await {
                report.errors.push(failure);
            }
        }

        log::info!(
            "Cleanup removed {} of {} candidates, freed {} bytes, {} errors",
            report.deleted_count,
            report.candidates.len(),
            report.bytes_freed,
            report.errors.len()
        );
        report
    }

    /// Drop the cached payload unless another live asset still holds it.
    fn invalidate_cache(&self, asset: &Asset) {
        match self.catalog.find_by_hash(&asset.content_hash) {
            Ok(Some(holder)) => log::debug!(
                "Keeping cached {} for {}",
                asset.content_hash.short(),
                holder.id
            ),
            Ok(None) => self.cache.invalidate(&asset.content_hash),
            Err(e) => {
                log::warn!(
                    "Hash lookup for {} failed, invalidating anyway: {}",
                    asset.content_hash.short(),
                    e
                );
                self.cache.invalidate(&asset.content_hash);
            }
        }
    }

    /// One rebuild for the whole batch, including ids left over from an
    /// earlier failed rebuild.
    async fn remove_from_index(&self, ids: impl Iterator<Item = AssetId>) -> IndexOutcome {
        let mut targets: HashSet<AssetId> = ids.collect();
        match self.dangling_ids().await {
            Ok(dangling) => targets.extend(dangling),
            Err(e) => log::warn!("Could not list stale index entries: {}", e),
        }
        if targets.is_empty() {
            return IndexOutcome::Skipped;
        }

        match self.index.rebuild_without(&targets).await {
            Ok(summary) => IndexOutcome::Rebuilt {
                removed: summary.removed,
                remaining: summary.remaining,
            },
            Err(e) => {
                log::error!(
                    "Index rebuild failed, {} deleted assets remain indexed: {}",
                    targets.len(),
                    e
                );
                let mut stale: Vec<AssetId> = targets.into_iter().collect();
                stale.sort_unstable();
                IndexOutcome::Failed {
                    message: e.to_string(),
                    stale,
                }
            }
        }
    }

    async fn delete_blob(&self, asset: &Asset) -> std::result::Result<(), CleanupFailure> {
        match self.catalog.location_in_use(&asset.location) {
            Ok(false) => {}
            Ok(true) => {
                log::debug!("Blob {} still referenced, keeping it", asset.location);
                return Ok(());
            }
            Err(e) => {
                return Err(CleanupFailure::new(
                    asset.id,
                    CleanupStage::Blob,
                    e.to_string(),
                ))
            }
        }

        match self.delete_blob_with_retry(&asset.location).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::debug!("Blob {} was already gone", asset.location);
                Ok(())
            }
            Err(e) => {
                log::warn!("Could not delete blob {}: {}", asset.location, e);
                Err(CleanupFailure::new(
                    asset.id,
                    CleanupStage::Blob,
                    e.to_string(),
                ))
            }
        }
    }

    /// Delete a blob, retrying transient failures with exponential backoff.
    async fn delete_blob_with_retry(&self, location: &str) -> Result<bool> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.blob_retry_delay)
            .with_max_times(self.blob_retries);
        (|| self.blobs.delete(location))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(|e: &Error| e.is_transient())
            .notify(|e: &Error, delay: Duration| {
                log::warn!(
                    "Deleting blob {} failed, retrying in {:?}: {}",
                    location,
                    delay,
                    e
                );
            })
            .await
    }
}

// Verification
impl ConsistencyCoordinator {
    /// Compare the catalog and the index.
    ///
    /// With `repair`, indexed entries that have no catalog row (and any ids
    /// left stale by a failed rebuild) are removed with one rebuild. Catalog
    /// rows without an embedding are reported but cannot be repaired here,
    /// since the vector is not known.
    pub async fn reconcile(&self, repair: bool) -> Result<ConsistencyReport> {
        // Index before catalog, for the same reason as `dangling_ids`.
        let indexed_ids = self.index.asset_ids().await;
        let indexed: HashSet<AssetId> = indexed_ids.iter().copied().collect();
        let catalog_ids: HashSet<AssetId> = self.catalog.list_ids()?.into_iter().collect();

        let mut missing: Vec<AssetId> = catalog_ids.difference(&indexed).copied().collect();
        missing.sort_unstable();
        let mut dangling: Vec<AssetId> = indexed.difference(&catalog_ids).copied().collect();
        dangling.sort_unstable();

        let warnings: Vec<ConsistencyWarning> = missing
            .iter()
            .map(|&asset_id| ConsistencyWarning::MissingEmbedding { asset_id })
            .chain(
                dangling
                    .iter()
                    .map(|&asset_id| ConsistencyWarning::DanglingEmbedding { asset_id }),
            )
            .collect();
        for warning in &warnings {
            log::warn!("{}", warning);
        }

        let repair = if repair {
            Some(self.remove_from_index(dangling.into_iter()).await)
        } else {
            None
        };

        Ok(ConsistencyReport {
            catalog_assets: catalog_ids.len(),
            indexed_vectors: indexed_ids.len(),
            warnings,
            repair,
        })
    }

    /// Blobs present in the store that no live asset points at.
    pub async fn orphan_blobs(&self) -> Result<Vec<ConsistencyWarning>> {
        Ok(self
            .orphan_locations()
            .await?
            .into_iter()
            .map(|location| ConsistencyWarning::OrphanBlob { location })
            .collect())
    }

    /// Delete every blob that no live asset points at.
    ///
    /// Each location is checked against the catalog again just before it is
    /// deleted, so a blob claimed by an admission since the scan is kept.
    /// Failures are recorded per location and do not stop the sweep.
    pub async fn delete_orphan_blobs(&self) -> Result<OrphanBlobReport> {
        let orphans = self.orphan_locations().await?;
        let mut report = OrphanBlobReport {
            found: orphans.len(),
            ..OrphanBlobReport::default()
        };

        for location in orphans {
            match self.catalog.location_in_use(&location) {
                Ok(false) => {}
                Ok(true) => {
                    log::debug!("Blob {} was claimed since the scan, keeping it", location);
                    report.kept += 1;
                    continue;
                }
                Err(e) => {
                    report.failures.push(BlobFailure::new(location, e.to_string()));
                    continue;
                }
            }
            match self.delete_blob_with_retry(&location).await {
                Ok(_) => report.removed.push(location),
                Err(e) => {
                    log::warn!("Could not delete orphan blob {}: {}", location, e);
                    report.failures.push(BlobFailure::new(location, e.to_string()));
                }
            }
        }

        log::info!(
            "Removed {} of {} orphan blobs, {} failures",
            report.removed.len(),
            report.found,
            report.failures.len()
        );
        Ok(report)
    }

    async fn orphan_locations(&self) -> Result<Vec<String>> {
        let referenced: HashSet<String> = self
            .catalog
            .list_all()?
            .into_iter()
            .map(|a| a.location)
            .collect();
        let mut orphans: Vec<String> = self
            .blobs
            .list()
            .await?
            .into_iter()
            .filter(|location| !referenced.contains(location))
            .collect();
        orphans.sort();
        Ok(orphans)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timbre_core::model::ContentHash;
    use timbre_core::MemoryBlobStore;
    use timbre_search::IndexConfig;

    fn coordinator() -> (ConsistencyCoordinator, Arc<MemoryBlobStore>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        let coordinator = ConsistencyCoordinator::new(
            Arc::new(AssetCatalog::open_in_memory().unwrap()),
            Arc::new(EmbeddingIndex::new(IndexConfig::new(2)).unwrap()),
            Arc::new(ContentCache::new(Duration::from_secs(60))),
            Arc::clone(&blobs) as Arc<dyn BlobStore>,
        );
        (coordinator, blobs)
    }

    fn request(hash: &str, vector: [f32; 2]) -> AdmitRequest {
        AdmitRequest {
            content_hash: ContentHash::new(hash),
            vector: vector.to_vec(),
            size_bytes: 100,
            location: format!("blobs/{hash}"),
            tags: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_admit_writes_catalog_and_index() {
        let (coordinator, _) = coordinator();
        let admission = coordinator.admit(request("h1", [1.0, 0.0])).await.unwrap();

        assert!(admission.is_new());
        let id = admission.asset_id();
        assert!(coordinator.catalog().get(id).unwrap().is_some());
        assert!(coordinator.index().contains(id).await);
    }

    #[tokio::test]
    async fn test_admit_duplicate_mutates_nothing() {
        let (coordinator, _) = coordinator();
        let first = coordinator.admit(request("h1", [1.0, 0.0])).await.unwrap();
        let second = coordinator.admit(request("h1", [0.0, 1.0])).await.unwrap();

        assert_eq!(second, Admission::DuplicateOf(first.asset_id()));
        assert_eq!(coordinator.catalog().count_live().unwrap(), 1);
        assert_eq!(coordinator.index().size().await, 1);
    }

    #[tokio::test]
    async fn test_failed_index_add_removes_catalog_row() {
        let (coordinator, _) = coordinator();
        let mut bad = request("h1", [1.0, 0.0]);
        bad.vector = vec![1.0, 0.0, 0.0];

        let err = coordinator.admit(bad).await.unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert_eq!(coordinator.catalog().count_live().unwrap(), 0);
        assert_eq!(coordinator.index().size().await, 0);
    }

    #[tokio::test]
    async fn test_get_asset_records_access() {
        let (coordinator, _) = coordinator();
        let id = coordinator
            .admit(request("h1", [1.0, 0.0]))
            .await
            .unwrap()
            .asset_id();
        let before = coordinator.catalog().get(id).unwrap().unwrap();

        let fetched = coordinator.get_asset(id).unwrap();
        assert!(fetched.last_accessed_at >= before.last_accessed_at);
        assert!(coordinator.get_asset(AssetId::new()).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_find_similar_excludes_self() {
        let (coordinator, _) = coordinator();
        let a = coordinator.admit(request("a", [1.0, 0.0])).await.unwrap();
        let b = coordinator.admit(request("b", [0.9, 0.1])).await.unwrap();
        coordinator.admit(request("c", [0.0, 1.0])).await.unwrap();

        let similar = coordinator.find_similar(a.asset_id(), 1).await.unwrap();
        assert_eq!(similar.len(), 1);
        assert_eq!(similar[0].asset_id, b.asset_id());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_cache_for_shared_hash() {
        let (coordinator, _) = coordinator();
        let hash = ContentHash::new("shared");
        let canonical = Asset::new(hash.clone(), 10, "blobs/one")
            .with_created_at(chrono::Utc::now() - chrono::Duration::hours(1));
        let copy = Asset::new(hash.clone(), 10, "blobs/two");
        coordinator.catalog().import(&canonical).unwrap();
        coordinator.catalog().import(&copy).unwrap();
        coordinator.cache().put(hash.clone(), vec![1, 2, 3], Duration::from_secs(60));

        let report = coordinator.resolve_duplicates(false).await.unwrap();
        assert_eq!(report.cleanup.deleted_count, 1);
        assert_eq!(coordinator.cache().get(&hash), Some(vec![1, 2, 3]));

        coordinator.catalog().delete(canonical.id).unwrap();
        let orphan = Asset::new(hash.clone(), 10, "blobs/three")
            .with_created_at(chrono::Utc::now() - chrono::Duration::hours(2));
        coordinator.catalog().import(&orphan).unwrap();
        let report = coordinator
            .cleanup(CleanupCriteria::older_than(chrono::Duration::hours(1)), false)
            .await
            .unwrap();
        assert_eq!(report.deleted_count, 1);
        assert_eq!(coordinator.cache().get(&hash), None);
    }

    #[tokio::test]
    async fn test_blob_shared_by_canonical_is_kept() {
        let (coordinator, blobs) = coordinator();
        let hash = ContentHash::new("same");
        let canonical = Asset::new(hash.clone(), 10, "blobs/same")
            .with_created_at(chrono::Utc::now() - chrono::Duration::hours(1));
        let copy = Asset::new(hash, 10, "blobs/same");
        coordinator.catalog().import(&canonical).unwrap();
        coordinator.catalog().import(&copy).unwrap();
        blobs.insert("blobs/same");

        let report = coordinator.resolve_duplicates(false).await.unwrap();
        assert_eq!(report.cleanup.deleted_count, 1);
        assert!(blobs.contains("blobs/same"));
    }

    #[tokio::test]
    async fn test_orphan_blobs() {
        let (coordinator, blobs) = coordinator();
        coordinator.admit(request("h1", [1.0, 0.0])).await.unwrap();
        blobs.insert("blobs/h1");
        blobs.insert("blobs/stray");

        let orphans = coordinator.orphan_blobs().await.unwrap();
        assert_eq!(
            orphans,
            vec![ConsistencyWarning::OrphanBlob {
                location: "blobs/stray".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_query_similar_tagged() {
        let (coordinator, _) = coordinator();
        let mut near = request("near", [1.0, 0.0]);
        near.tags = vec!["folk".into()];
        let mut far = request("far", [0.0, 1.0]);
        far.tags = vec!["rock".into(), "live".into()];
        coordinator.admit(near).await.unwrap();
        let far = coordinator.admit(far).await.unwrap();

        let rock = coordinator
            .query_similar_tagged(&[1.0, 0.0], 1, &["rock".into()])
            .await
            .unwrap();
        assert_eq!(rock.len(), 1);
        assert_eq!(rock[0].asset_id, far.asset_id());

        let none = coordinator
            .query_similar_tagged(&[1.0, 0.0], 5, &["rock".into(), "folk".into()])
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_delete_orphan_blobs() {
        let (coordinator, blobs) = coordinator();
        coordinator.admit(request("h1", [1.0, 0.0])).await.unwrap();
        blobs.insert("blobs/h1");
        blobs.insert("blobs/stray-1");
        blobs.insert("blobs/stray-2");

        let report = coordinator.delete_orphan_blobs().await.unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.removed, vec!["blobs/stray-1", "blobs/stray-2"]);
        assert!(report.is_complete());
        assert!(blobs.contains("blobs/h1"));
        assert_eq!(blobs.len(), 1);
        assert!(coordinator.orphan_blobs().await.unwrap().is_empty());
    }

    /// Refuses to delete one location; everything else goes to memory.
    #[derive(Debug, Default)]
    struct StubbornBlobStore {
        inner: MemoryBlobStore,
        protected: String,
    }

    #[async_trait::async_trait]
    impl BlobStore for StubbornBlobStore {
        async fn exists(&self, location: &str) -> Result<bool> {
            self.inner.exists(location).await
        }

        async fn delete(&self, location: &str) -> Result<bool> {
            if location == self.protected {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "read-only volume",
                )));
            }
            self.inner.delete(location).await
        }

        async fn list(&self) -> Result<Vec<String>> {
            self.inner.list().await
        }
    }

    #[tokio::test]
    async fn test_delete_orphan_blobs_records_failures() {
        let store = StubbornBlobStore {
            protected: "blobs/pinned".into(),
            ..StubbornBlobStore::default()
        };
        store.inner.insert("blobs/pinned");
        store.inner.insert("blobs/loose");
        let store = Arc::new(store);
        let coordinator = ConsistencyCoordinator::new(
            Arc::new(AssetCatalog::open_in_memory().unwrap()),
            Arc::new(EmbeddingIndex::new(IndexConfig::new(2)).unwrap()),
            Arc::new(ContentCache::new(Duration::from_secs(60))),
            Arc::clone(&store) as Arc<dyn BlobStore>,
        )
        .with_blob_retry(1, Duration::from_millis(1));

        let report = coordinator.delete_orphan_blobs().await.unwrap();
        assert_eq!(report.found, 2);
        assert_eq!(report.removed, vec!["blobs/loose"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].location, "blobs/pinned");
        assert!(report.failures[0].message.contains("read-only volume"));
        assert!(store.inner.contains("blobs/pinned"));
    }
}
