//! Cache key derivation.
//!
//! A [`CacheKeyProvider`] names every cache entry that depends on an entity.
//! Writes collect those names across all touched entities and invalidate the
//! deduplicated set in one call.

use std::collections::BTreeSet;
use std::fmt::Display;

/// Maps an entity to the cache keys that must be invalidated when it changes.
pub trait CacheKeyProvider<T>: Send + Sync {
    fn cache_keys(&self, entity: &T) -> Vec<String>;
}

impl<T, F> CacheKeyProvider<T> for F
where
    F: Fn(&T) -> Vec<String> + Send + Sync,
{
    fn cache_keys(&self, entity: &T) -> Vec<String> {
        self(entity)
    }
}

/// Keys of every entity in `entities`, deduplicated and sorted.
pub fn keys_for_many<T, P>(provider: &P, entities: &[T]) -> Vec<String>
where
    P: CacheKeyProvider<T> + ?Sized,
{
    unique_keys(entities.iter().flat_map(|entity| provider.cache_keys(entity)))
}

pub fn unique_keys<I>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    keys.into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// `prefix` followed by the rendered id, e.g. `cache:app:users:id:` + `42`.
pub fn format_key(prefix: &str, id: impl Display) -> String {
    format!("{prefix}{id}")
}
