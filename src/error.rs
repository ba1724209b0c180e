use thiserror::Error;

use crate::cache::CacheError;
use crate::context::ContextError;
use crate::repo::RepoError;

/// Errors surfaced by [`crate::conn::CachedConn`] and the cache facade.
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    /// Zero rows, or a negative-cache hit.
    #[error("record not found")]
    NotFound,
    #[error("repository error: {0}")]
    Store(RepoError),
    #[error("cache error: {0}")]
    Cache(CacheError),
    /// The write was applied but the affected keys could not be removed.
    #[error("write applied but invalidating {} cache key(s) failed: {source}", .keys.len())]
    Invalidation {
        keys: Vec<String>,
        source: CacheError,
    },
    #[error(transparent)]
    Context(ContextError),
    #[error("cache payload serialization failed: {0}")]
    Serialization(String),
}

impl ConnError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

impl From<RepoError> for ConnError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound => Self::NotFound,
            RepoError::Cancelled => Self::Context(ContextError::Cancelled),
            other => Self::Store(other),
        }
    }
}

impl From<CacheError> for ConnError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Context(ctx) => Self::Context(ctx),
            CacheError::Codec(message) => Self::Serialization(message),
            other => Self::Cache(other),
        }
    }
}

impl From<ContextError> for ConnError {
    fn from(err: ContextError) -> Self {
        Self::Context(err)
    }
}

impl From<serde_json::Error> for ConnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
