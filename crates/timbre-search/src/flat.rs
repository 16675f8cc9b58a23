//! Flat vector storage with exact search.

use std::cmp::Ordering;
use std::collections::HashMap;

use timbre_core::model::AssetId;

use crate::metric::Metric;

/// Vectors stored contiguously, one slot per asset.
///
/// `ids[slot]` names the asset stored at `slot` and `slots` maps back, so
/// the id-map and the vector array always describe the same entries.
#[derive(Debug, Clone)]
pub(crate) struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
    ids: Vec<AssetId>,
    slots: HashMap<AssetId, usize>,
}

impl FlatIndex {
    pub(crate) fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
            ids: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Build from already-prepared vectors. Later duplicates of an id are
    /// ignored.
    pub(crate) fn from_entries<'a>(
        dimension: usize,
        entries: impl IntoIterator<Item = (AssetId, &'a [f32])>,
    ) -> Self {
        let mut index = Self::new(dimension);
        for (id, vector) in entries {
            if !index.contains(id) {
                index.push(id, vector);
            }
        }
        index
    }

    pub(crate) fn len(&self) -> usize {
        self.ids.len()
    }

    pub(crate) fn contains(&self, id: AssetId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Append a prepared vector. The caller checks dimension and uniqueness.
    pub(crate) fn push(&mut self, id: AssetId, vector: &[f32]) -> usize {
        debug_assert_eq!(vector.len(), self.dimension);
        let slot = self.ids.len();
        self.data.extend_from_slice(vector);
        self.ids.push(id);
        self.slots.insert(id, slot);
        slot
    }

    pub(crate) fn vector(&self, id: AssetId) -> Option<&[f32]> {
        self.slots.get(&id).map(|&slot| self.slot_vector(slot))
    }

    fn slot_vector(&self, slot: usize) -> &[f32] {
        let start = slot * self.dimension;
        &self.data[start..start + self.dimension]
    }

    pub(crate) fn ids(&self) -> &[AssetId] {
        &self.ids
    }

    /// Entries in slot order.
    pub(crate) fn entries(&self) -> impl Iterator<Item = (AssetId, &[f32])> + '_ {
        self.ids
            .iter()
            .enumerate()
            .map(|(slot, &id)| (id, self.slot_vector(slot)))
    }

    /// Top `k` entries by descending score, ties by ascending asset id.
    pub(crate) fn search(&self, query: &[f32], k: usize, metric: Metric) -> Vec<(AssetId, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let mut scored: Vec<(AssetId, f32)> = self
            .entries()
            .map(|(id, vector)| (id, metric.score(vector, query)))
            .collect();
        let by_rank = |a: &(AssetId, f32), b: &(AssetId, f32)| -> Ordering {
            b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
        };
        if scored.len() > k {
            scored.select_nth_unstable_by(k - 1, by_rank);
            scored.truncate(k);
        }
        scored.sort_unstable_by(by_rank);
        scored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use timbre_core::model::AssetId;
    use uuid::Uuid;

    fn id(n: u128) -> AssetId {
        AssetId::from_uuid(Uuid::from_u128(n))
    }

    #[test]
    fn test_push_keeps_id_map_in_step() {
        let mut index = FlatIndex::new(2);
        assert_eq!(index.push(id(1), &[1.0, 0.0]), 0);
        assert_eq!(index.push(id(2), &[0.0, 1.0]), 1);
        assert_eq!(index.len(), 2);
        assert_eq!(index.vector(id(2)), Some(&[0.0, 1.0][..]));
        assert_eq!(index.ids(), &[id(1), id(2)]);
    }

    #[test]
    fn test_search_orders_by_score_then_id() {
        let mut index = FlatIndex::new(2);
        index.push(id(3), &[1.0, 0.0]);
        index.push(id(1), &[1.0, 0.0]);
        index.push(id(2), &[0.0, 1.0]);

        let hits = index.search(&[1.0, 0.0], 3, Metric::Cosine);
        let order: Vec<AssetId> = hits.iter().map(|h| h.0).collect();
        assert_eq!(order, vec![id(1), id(3), id(2)]);
    }

    #[test]
    fn test_search_truncates_to_k() {
        let mut index = FlatIndex::new(1);
        for n in 0..10 {
            index.push(id(n), &[n as f32]);
        }
        let hits = index.search(&[9.0], 3, Metric::Euclidean);
        let order: Vec<AssetId> = hits.iter().map(|h| h.0).collect();
        assert_eq!(order, vec![id(9), id(8), id(7)]);
        assert!(index.search(&[9.0], 0, Metric::Euclidean).is_empty());
    }

    #[test]
    fn test_from_entries_skips_repeated_ids() {
        let a = [1.0_f32, 0.0];
        let b = [0.0_f32, 1.0];
        let index = FlatIndex::from_entries(2, vec![(id(1), &a[..]), (id(1), &b[..])]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.vector(id(1)), Some(&a[..]));
    }
}
