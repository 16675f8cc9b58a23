//! On-disk snapshots of the embedding index.
//!
//! A snapshot is gzip-compressed JSON holding the dimension, the metric, and
//! every `(asset_id, vector)` entry in slot order. Vectors are stored in
//! their prepared form, so loading does not re-normalise them.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use timbre_core::model::AssetId;
use timbre_core::{Error, Result};

use crate::flat::FlatIndex;
use crate::metric::Metric;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotOut<'a> {
    version: u32,
    dimension: usize,
    metric: Metric,
    entries: Vec<EntryOut<'a>>,
}

#[derive(Serialize)]
struct EntryOut<'a> {
    asset_id: AssetId,
    vector: &'a [f32],
}

#[derive(Deserialize)]
struct SnapshotIn {
    version: u32,
    dimension: usize,
    metric: Metric,
    entries: Vec<EntryIn>,
}

#[derive(Deserialize)]
struct EntryIn {
    asset_id: AssetId,
    vector: Vec<f32>,
}

/// Write `index` to `path`, replacing any existing snapshot atomically.
pub(crate) fn write(path: &Path, index: &FlatIndex, dimension: usize, metric: Metric) -> Result<()> {
    let snapshot = SnapshotOut {
        version: SNAPSHOT_VERSION,
        dimension,
        metric,
        entries: index
            .entries()
            .map(|(asset_id, vector)| EntryOut { asset_id, vector })
            .collect(),
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &snapshot)?;
        let writer = encoder.finish()?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Read a snapshot, checking it matches the expected dimension and metric.
pub(crate) fn read(path: &Path, dimension: usize, metric: Metric) -> Result<FlatIndex> {
    let file = File::open(path)?;
    let snapshot: SnapshotIn = serde_json::from_reader(GzDecoder::new(BufReader::new(file)))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(Error::InvalidData(format!(
            "unsupported index snapshot version {}",
            snapshot.version
        )));
    }
    if snapshot.dimension != dimension {
        return Err(Error::DimensionMismatch {
            expected: dimension,
            actual: snapshot.dimension,
        });
    }
    if snapshot.metric != metric {
        return Err(Error::InvalidData(format!(
            "index snapshot uses {} similarity, configured {}",
            snapshot.metric, metric
        )));
    }
    if let Some(bad) = snapshot.entries.iter().find(|e| e.vector.len() != dimension) {
        return Err(Error::InvalidData(format!(
            "snapshot entry {} has {} dimensions",
            bad.asset_id,
            bad.vector.len()
        )));
    }

    Ok(FlatIndex::from_entries(
        dimension,
        snapshot
            .entries
            .iter()
            .map(|e| (e.asset_id, e.vector.as_slice())),
    ))
}
