//! Read-through, write-invalidate caching over a generic repository.
//!
//! - [`repo`]: the [`Repository`] abstraction with Postgres and in-memory implementations
//! - [`cache`]: the [`Cache`] facade, its backends and key derivation
//! - [`conn`]: [`CachedConn`], which ties a repository to a cache
//! - [`page`]: client paging and ordering via [`PageExecutor`]

pub mod cache;
pub mod config;
pub mod conn;
pub mod context;
pub mod error;
pub mod page;
pub mod repo;
pub mod telemetry;

pub use cache::{Cache, CacheBackend, CacheConfig, CacheKeyProvider, MemoryBackend};
pub use conn::{BatchOptions, CachedConn};
pub use context::{Context, ContextError};
pub use error::ConnError;
pub use page::{OrderParams, PageExecutor, PageParams};
pub use repo::{Entity, RepoError, Repository};
