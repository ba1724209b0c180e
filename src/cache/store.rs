//! Cache storage implementations.
//!
//! [`CacheBackend`] is the boundary to a key/value store with per-entry
//! expiry. [`MemoryBackend`] is the in-process implementation: an LRU map
//! whose entries also carry an absolute expiry instant.

use std::sync::RwLock;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use time::OffsetDateTime;

use super::config::CacheConfig;
use super::lock::{rw_read, rw_write};
use super::{CacheError, METRIC_CACHE_EVICT};

const SOURCE: &str = "cache::store";

/// A string key/value store with per-entry expiry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Returns `None` for missing or expired keys.
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(
        &self,
        key: &str,
        value: String,
        expires_at: OffsetDateTime,
    ) -> Result<(), CacheError>;

    /// Removes every key in one call. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<(), CacheError>;
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: OffsetDateTime,
}

/// LRU-bounded in-process backend.
pub struct MemoryBackend {
    entries: RwLock<LruCache<String, Slot>>,
}

impl MemoryBackend {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(config.memory_capacity_non_zero())),
        }
    }

    /// Expiry instant of a live entry.
    pub fn expires_at(&self, key: &str) -> Option<OffsetDateTime> {
        rw_read(&self.entries, SOURCE, "expires_at")
            .peek(key)
            .filter(|slot| slot.expires_at > OffsetDateTime::now_utc())
            .map(|slot| slot.expires_at)
    }

    /// Raw stored value without touching recency.
    pub fn peek(&self, key: &str) -> Option<String> {
        rw_read(&self.entries, SOURCE, "peek")
            .peek(key)
            .filter(|slot| slot.expires_at > OffsetDateTime::now_utc())
            .map(|slot| slot.value.clone())
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(slot) if slot.expires_at > OffsetDateTime::now_utc() => {
                return Ok(Some(slot.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: String,
        expires_at: OffsetDateTime,
    ) -> Result<(), CacheError> {
        let evicted = rw_write(&self.entries, SOURCE, "set")
            .push(key.to_owned(), Slot { value, expires_at });
        if matches!(evicted, Some((ref old_key, _)) if old_key != key) {
            counter!(METRIC_CACHE_EVICT).increment(1);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut entries = rw_write(&self.entries, SOURCE, "delete");
        for key in keys {
            entries.pop(key);
        }
        Ok(())
    }
}
