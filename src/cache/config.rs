//! Cache configuration.
//!
//! Loaded from the `[cache]` table of `repocache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_NOT_FOUND_EXPIRY_SECS: u64 = 60;
const DEFAULT_SAFETY_GAP_SECS: u64 = 5;
const DEFAULT_EXPIRY_DEVIATION: f64 = 0.05;
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_BATCH_SIZE: usize = 500;

/// Cache configuration from `repocache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base lifetime of a cached row, before jitter.
    pub expiry_secs: u64,
    /// Lifetime of the not-found placeholder, before jitter.
    pub not_found_expiry_secs: u64,
    /// How much longer a primary entry lives than the index entry pointing at it.
    pub safety_gap_secs: u64,
    /// Relative jitter applied to every expiry, in `[0, 1)`.
    pub expiry_deviation: f64,
    /// Entry limit of the in-process LRU backend.
    pub memory_capacity: usize,
    /// Default chunk size for batch writes.
    pub batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expiry_secs: DEFAULT_EXPIRY_SECS,
            not_found_expiry_secs: DEFAULT_NOT_FOUND_EXPIRY_SECS,
            expiry_deviation: DEFAULT_EXPIRY_DEVIATION,
            safety_gap_secs: DEFAULT_SAFETY_GAP_SECS,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_secs)
    }

    pub fn not_found_expiry(&self) -> Duration {
        Duration::from_secs(self.not_found_expiry_secs)
    }

    pub fn safety_gap(&self) -> Duration {
        Duration::from_secs(self.safety_gap_secs)
    }

    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the batch size as NonZeroUsize, clamping to 1 if zero.
    pub fn batch_size_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.batch_size).unwrap_or(NonZeroUsize::MIN)
    }

    /// Checks the values serde cannot constrain on its own.
    pub fn validate(&self) -> Result<(), (&'static str, String)> {
        if !(0.0..1.0).contains(&self.expiry_deviation) {
            return Err((
                "cache.expiry_deviation",
                format!("must be in [0, 1), got {}", self.expiry_deviation),
            ));
        }
        if self.expiry_secs == 0 {
            return Err(("cache.expiry_secs", "must be greater than zero".into()));
        }
        if self.not_found_expiry_secs == 0 {
            return Err((
                "cache.not_found_expiry_secs",
                "must be greater than zero".into(),
            ));
        }
        if self.safety_gap_secs == 0 {
            return Err((
                "cache.safety_gap_secs",
                "must be greater than zero so rows outlive their index entries".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.expiry(), Duration::from_secs(604_800));
        assert_eq!(config.not_found_expiry(), Duration::from_secs(60));
        assert_eq!(config.safety_gap(), Duration::from_secs(5));
        assert_eq!(config.expiry_deviation, 0.05);
        assert_eq!(config.memory_capacity, 10_000);
        assert_eq!(config.batch_size, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn non_zero_clamps_to_one() {
        let config = CacheConfig {
            memory_capacity: 0,
            batch_size: 0,
            ..Default::default()
        };
        assert_eq!(config.memory_capacity_non_zero().get(), 1);
        assert_eq!(config.batch_size_non_zero().get(), 1);
    }

    #[test]
    fn deviation_out_of_range_is_rejected() {
        let config = CacheConfig {
            expiry_deviation: 1.0,
            ..Default::default()
        };
        let (key, _) = config.validate().unwrap_err();
        assert_eq!(key, "cache.expiry_deviation");
    }

    #[test]
    fn zero_expiry_is_rejected() {
        let config = CacheConfig {
            expiry_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_safety_gap_is_rejected() {
        let config = CacheConfig {
            safety_gap_secs: 0,
            ..Default::default()
        };
        let (key, _) = config.validate().unwrap_err();
        assert_eq!(key, "cache.safety_gap_secs");
    }
}
