//! Hash-keyed result cache.
//!
//! Derived results (transcriptions, analyses) are cached by content hash so
//! identical uploads skip recomputation. Entries expire passively after
//! their TTL and are removed explicitly when the owning asset is deleted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::model::ContentHash;

/// A cached payload and its expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Vec<u8>,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// TTL cache keyed by content hash.
#[derive(Debug)]
pub struct ContentCache {
    entries: Mutex<HashMap<ContentHash, CacheEntry>>,
    default_ttl: Duration,
}

impl ContentCache {
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    #[must_use]
    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ContentHash, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a payload. Expired entries are removed on the way out.
    pub fn get(&self, hash: &ContentHash) -> Option<Vec<u8>> {
        let mut entries = self.entries();
        match entries.get(hash) {
            Some(entry) if entry.is_expired(Instant::now()) => {
                entries.remove(hash);
                None
            }
            Some(entry) => Some(entry.payload.clone()),
            None => None,
        }
    }

    /// Store a payload, replacing any existing entry.
    pub fn put(&self, hash: ContentHash, payload: Vec<u8>, ttl: Duration) {
        let now = Instant::now();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(self.default_ttl))
            .unwrap_or(now);
        self.entries().insert(
            hash,
            CacheEntry {
                payload,
                expires_at,
            },
        );
    }

    /// Remove an entry immediately. Absent keys are ignored.
    pub fn invalidate(&self, hash: &ContentHash) {
        if self.entries().remove(hash).is_some() {
            log::debug!("Invalidated cache entry {}", hash.short());
        }
    }

    /// Return the cached payload, computing and storing it on a miss.
    ///
    /// `compute` runs without the cache lock held.
    pub fn get_or_try_insert_with<E>(
        &self,
        hash: &ContentHash,
        compute: impl FnOnce() -> Result<Vec<u8>, E>,
    ) -> Result<Vec<u8>, E> {
        if let Some(payload) = self.get(hash) {
            return Ok(payload);
        }
        let payload = compute()?;
        self.put(hash.clone(), payload.clone(), self.default_ttl);
        Ok(payload)
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let purged = before - entries.len();
        if purged > 0 {
            log::info!("Purged {} expired cache entries", purged);
        }
        purged
    }

    /// Number of stored entries, including expired ones not yet reaped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContentCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(s: &str) -> ContentHash {
        ContentHash::from(s)
    }

    #[test]
    fn test_put_then_get() {
        let cache = ContentCache::default();
        cache.put(hash("a"), b"lyrics".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get(&hash("a")), Some(b"lyrics".to_vec()));
        assert_eq!(cache.get(&hash("b")), None);
    }

    #[test]
    fn test_put_overwrites() {
        let cache = ContentCache::default();
        cache.put(hash("a"), b"one".to_vec(), Duration::from_secs(60));
        cache.put(hash("a"), b"two".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.get(&hash("a")), Some(b"two".to_vec()));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_is_reaped_on_get() {
        let cache = ContentCache::default();
        cache.put(hash("a"), b"stale".to_vec(), Duration::ZERO);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&hash("a")), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let cache = ContentCache::default();
        cache.put(hash("a"), b"x".to_vec(), Duration::from_secs(60));
        cache.invalidate(&hash("a"));
        cache.invalidate(&hash("a"));
        cache.invalidate(&hash("never-stored"));
        assert_eq!(cache.get(&hash("a")), None);
    }

    #[test]
    fn test_purge_expired() {
        let cache = ContentCache::default();
        cache.put(hash("old"), b"x".to_vec(), Duration::ZERO);
        cache.put(hash("fresh"), b"y".to_vec(), Duration::from_secs(60));
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&hash("fresh")).is_some());
    }

    #[test]
    fn test_get_or_try_insert_with_computes_once() {
        let cache = ContentCache::default();
        let mut calls = 0;
        let first: Result<Vec<u8>, String> = cache.get_or_try_insert_with(&hash("a"), || {
            calls += 1;
            Ok(b"computed".to_vec())
        });
        assert_eq!(first.unwrap(), b"computed".to_vec());

        let second: Result<Vec<u8>, String> =
            cache.get_or_try_insert_with(&hash("a"), || Err("should not run".to_string()));
        assert_eq!(second.unwrap(), b"computed".to_vec());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_get_or_try_insert_with_propagates_errors() {
        let cache = ContentCache::default();
        let result: Result<Vec<u8>, &str> =
            cache.get_or_try_insert_with(&hash("a"), || Err("model unavailable"));
        assert_eq!(result, Err("model unavailable"));
        assert!(cache.is_empty());
    }
}
