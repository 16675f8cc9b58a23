use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::model::{
    Asset, AssetId, CleanupCandidate, CleanupCriteria, CleanupReason, ContentHash,
    DuplicateGroup,
};

use super::migrations::MIGRATIONS;

const ASSET_COLUMNS: &str =
    "id, content_hash, size_bytes, location, created_at, last_accessed_at, tags";

/// Summary figures for the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub live_assets: usize,
    pub total_bytes: u64,
    pub duplicate_groups: usize,
}

/// The authoritative asset record store, backed by SQLite.
#[derive(Debug)]
pub struct AssetCatalog {
    conn: Mutex<Connection>,
}

impl AssetCatalog {
    /// Open (or create) a catalog at the given path and apply migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory catalog (for tests).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        apply_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Lock the underlying connection (for advanced queries).
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let applied: Vec<u32> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for migration in MIGRATIONS {
        if !applied.contains(&migration.version) {
            log::info!(
                "Applying migration {} ({})",
                migration.version,
                migration.name
            );
            conn.execute_batch(migration.sql)?;
            conn.execute(
                "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
                rusqlite::params![migration.version, migration.name],
            )?;
        }
    }

    Ok(())
}

// Asset CRUD
impl AssetCatalog {
    /// Insert a new asset, rejecting content already held by a live asset.
    ///
    /// The hash check and the insert run in one immediate transaction.
    pub fn insert(&self, asset: &Asset) -> Result<AssetId> {
        let conn = self.conn();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        if let Some(existing) = find_by_hash_in(&tx, &asset.content_hash)? {
            return Err(Error::DuplicateContent {
                hash: asset.content_hash.clone(),
                existing: existing.id,
            });
        }
        insert_row(&tx, asset)?;
        tx.commit()?;
        Ok(asset.id)
    }

    /// Store a record without the duplicate-content check.
    ///
    /// Used to bring in rows from an older store, which may already contain
    /// duplicates for `duplicate_groups` to resolve.
    pub fn import(&self, asset: &Asset) -> Result<AssetId> {
        insert_row(&self.conn(), asset)?;
        Ok(asset.id)
    }

    pub fn get(&self, id: AssetId) -> Result<Option<Asset>> {
        get_in(&self.conn(), id)
    }

    /// Find the live asset holding `hash`. When legacy duplicates exist the
    /// canonical (earliest created) one is returned.
    pub fn find_by_hash(&self, hash: &ContentHash) -> Result<Option<Asset>> {
        find_by_hash_in(&self.conn(), hash)
    }

    /// Remove an asset, returning the row as it was before deletion.
    pub fn delete(&self, id: AssetId) -> Result<Asset> {
        let conn = self.conn();
        let tx = Transaction::new_unchecked(&conn, TransactionBehavior::Immediate)?;
        let asset = get_in(&tx, id)?.ok_or_else(|| Error::asset_not_found(id))?;
        tx.execute("DELETE FROM assets WHERE id = ?1", [id.to_string()])?;
        tx.commit()?;
        Ok(asset)
    }

    pub fn update_tags(&self, id: AssetId, tags: &[String]) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE assets SET tags = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), serde_json::to_string(tags)?],
        )?;
        if changed == 0 {
            return Err(Error::asset_not_found(id));
        }
        Ok(())
    }

    /// Mark an asset as accessed now.
    pub fn record_access(&self, id: AssetId) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE assets SET last_accessed_at = ?2 WHERE id = ?1",
            rusqlite::params![id.to_string(), encode_timestamp(&Utc::now())],
        )?;
        if changed == 0 {
            return Err(Error::asset_not_found(id));
        }
        Ok(())
    }

    /// Whether any live asset points at `location`.
    pub fn location_in_use(&self, location: &str) -> Result<bool> {
        let in_use: bool = self.conn().query_row(
            "SELECT EXISTS(SELECT 1 FROM assets WHERE location = ?1)",
            [location],
            |row| row.get(0),
        )?;
        Ok(in_use)
    }

    pub fn count_live(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// All live assets, oldest first.
    pub fn list_all(&self) -> Result<Vec<Asset>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets ORDER BY created_at, id"
        ))?;
        let assets = stmt
            .query_map([], row_to_asset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(assets)
    }

    pub fn list_ids(&self) -> Result<Vec<AssetId>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM assets ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| parse_id(row, 0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    pub fn stats(&self) -> Result<CatalogStats> {
        let (count, bytes): (i64, i64) = self.conn().query_row(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM assets",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CatalogStats {
            live_assets: usize::try_from(count).unwrap_or_default(),
            total_bytes: u64::try_from(bytes).unwrap_or_default(),
            duplicate_groups: self.duplicate_groups()?.len(),
        })
    }
}

// Cleanup scans
impl AssetCatalog {
    /// Group live assets sharing a content hash. Only hashes held by more
    /// than one asset appear.
    pub fn duplicate_groups(&self) -> Result<Vec<DuplicateGroup>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ASSET_COLUMNS} FROM assets
             WHERE content_hash IN (
                 SELECT content_hash FROM assets
                 GROUP BY content_hash
                 HAVING COUNT(*) > 1
             )
             ORDER BY content_hash, created_at, id"
        ))?;
        let assets = stmt
            .query_map([], row_to_asset)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut by_hash: BTreeMap<ContentHash, Vec<Asset>> = BTreeMap::new();
        for asset in assets {
            by_hash
                .entry(asset.content_hash.clone())
                .or_default()
                .push(asset);
        }
        Ok(by_hash
            .into_values()
            .filter_map(DuplicateGroup::from_members)
            .collect())
    }

    /// Evaluate cleanup criteria against the live assets.
    ///
    /// Each criterion is evaluated independently and the results are merged
    /// by asset id. An asset matching several criteria is reported once,
    /// under the first of duplicate, orphaned, age.
    pub async fn list_candidates(
        &self,
        criteria: &CleanupCriteria,
        blobs: &dyn BlobStore,
    ) -> Result<Vec<CleanupCandidate>> {
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        if criteria.duplicates {
            for group in self.duplicate_groups()? {
                for candidate in group.candidates() {
                    if seen.insert(candidate.asset_id) {
                        candidates.push(candidate);
                    }
                }
            }
        }

        if !criteria.orphaned && criteria.older_than.is_none() {
            return Ok(candidates);
        }
        let assets = self.list_all()?;

        if criteria.orphaned {
            for asset in &assets {
                if seen.contains(&asset.id) {
                    continue;
                }
                if !blobs.exists(&asset.location).await? {
                    log::debug!("Asset {} has no blob at {}", asset.id, asset.location);
                    seen.insert(asset.id);
                    candidates.push(CleanupCandidate::new(asset, CleanupReason::Orphaned));
                }
            }
        }

        if let Some(age) = criteria.older_than {
            let cutoff = Utc::now() - age;
            for asset in &assets {
                if asset.created_at < cutoff && seen.insert(asset.id) {
                    candidates.push(CleanupCandidate::new(asset, CleanupReason::Age));
                }
            }
        }

        Ok(candidates)
    }
}

fn insert_row(conn: &Connection, asset: &Asset) -> Result<()> {
    let size = i64::try_from(asset.size_bytes)
        .map_err(|_| Error::InvalidData(format!("asset size {} too large", asset.size_bytes)))?;
    conn.execute(
        "INSERT INTO assets (
            id, content_hash, size_bytes, location, created_at, last_accessed_at, tags
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            asset.id.to_string(),
            asset.content_hash.as_str(),
            size,
            asset.location,
            encode_timestamp(&asset.created_at),
            encode_timestamp(&asset.last_accessed_at),
            serde_json::to_string(&asset.tags)?,
        ],
    )?;
    Ok(())
}

fn get_in(conn: &Connection, id: AssetId) -> Result<Option<Asset>> {
    let asset = conn
        .query_row(
            &format!("SELECT {ASSET_COLUMNS} FROM assets WHERE id = ?1"),
            [id.to_string()],
            row_to_asset,
        )
        .optional()?;
    Ok(asset)
}

fn find_by_hash_in(conn: &Connection, hash: &ContentHash) -> Result<Option<Asset>> {
    let asset = conn
        .query_row(
            &format!(
                "SELECT {ASSET_COLUMNS} FROM assets
                 WHERE content_hash = ?1
                 ORDER BY created_at, id
                 LIMIT 1"
            ),
            [hash.as_str()],
            row_to_asset,
        )
        .optional()?;
    Ok(asset)
}

/// Fixed-width UTC timestamps so that text order equals time order.
fn encode_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(
    idx: usize,
    ty: Type,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, Box::new(err))
}

fn parse_id(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<AssetId> {
    row.get::<_, String>(idx)?
        .parse()
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, Type::Text, e))
}

fn row_to_asset(row: &rusqlite::Row) -> rusqlite::Result<Asset> {
    let size: i64 = row.get(2)?;
    let tags: String = row.get(6)?;

    Ok(Asset {
        id: parse_id(row, 0)?,
        content_hash: ContentHash::new(row.get::<_, String>(1)?),
        size_bytes: u64::try_from(size).map_err(|e| conversion_error(2, Type::Integer, e))?,
        location: row.get(3)?,
        created_at: parse_timestamp(row, 4)?,
        last_accessed_at: parse_timestamp(row, 5)?,
        tags: serde_json::from_str(&tags).map_err(|e| conversion_error(6, Type::Text, e))?,
    })
}
