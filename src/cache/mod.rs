//! Read-through cache layer.
//!
//! - [`CacheBackend`]: the key/value store boundary (an LRU [`MemoryBackend`] ships in-crate)
//! - [`Cache`]: facade adding jittered expiry, negative caching and request coalescing
//! - [`CacheKeyProvider`]: maps entities to the keys a write must invalidate
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! expiry_secs = 604800
//! not_found_expiry_secs = 60
//! safety_gap_secs = 5
//! expiry_deviation = 0.05
//! memory_capacity = 10000
//! batch_size = 500
//! ```

mod config;
mod facade;
mod flight;
pub mod keys;
pub(crate) mod lock;
pub mod store;
mod unstable;

use thiserror::Error;

use crate::context::ContextError;

pub use self::config::CacheConfig;
pub use facade::Cache;
pub use flight::SingleFlight;
pub use keys::{CacheKeyProvider, format_key, keys_for_many, unique_keys};
pub use store::{CacheBackend, MemoryBackend};
pub use unstable::Unstable;

/// Stored in place of a value to remember that the row does not exist.
pub const NOT_FOUND_PLACEHOLDER: &str = "*";

pub(crate) const METRIC_CACHE_HIT: &str = "repocache_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "repocache_cache_miss_total";
pub(crate) const METRIC_CACHE_FAIL: &str = "repocache_cache_fail_total";
pub(crate) const METRIC_STORE_FAIL: &str = "repocache_store_fail_total";
pub(crate) const METRIC_CACHE_EVICT: &str = "repocache_cache_evict_total";
pub(crate) const METRIC_CACHE_SHARED: &str = "repocache_cache_shared_total";

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache codec error: {0}")]
    Codec(String),
    #[error(transparent)]
    Context(#[from] ContextError),
}

impl CacheError {
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}
