//! Cached connection: a repository paired with a cache.
//!
//! Reads go through the cache (`query`, `query_row_index`); writes run against
//! the repository and then invalidate every affected key (`exec` and the
//! batch operations). Key derivation is delegated to a [`CacheKeyProvider`].

mod batch;
mod index;

pub use batch::BatchOptions;

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, warn};

use crate::cache::{Cache, CacheKeyProvider, unique_keys};
use crate::context::Context;
use crate::error::ConnError;
use crate::repo::{Entity, RepoError, Repository, TxHandle};
use crate::telemetry::{SpanScope, TracingSpans};

const SOURCE: &str = "conn";

pub struct CachedConn<T, R, P> {
    repo: R,
    cache: Cache,
    keys: Arc<P>,
    spans: Arc<dyn SpanScope>,
    _entity: PhantomData<fn() -> T>,
}

impl<T, R: Clone, P> Clone for CachedConn<T, R, P> {
    fn clone(&self) -> Self {
        Self {
            repo: self.repo.clone(),
            cache: self.cache.clone(),
            keys: Arc::clone(&self.keys),
            spans: Arc::clone(&self.spans),
            _entity: PhantomData,
        }
    }
}

impl<T, R, P> CachedConn<T, R, P>
where
    T: Entity,
    R: Repository<T>,
    P: CacheKeyProvider<T> + 'static,
{
    pub fn new(repo: R, cache: Cache, keys: P) -> Self {
        Self {
            repo,
            cache,
            keys: Arc::new(keys),
            spans: Arc::new(TracingSpans::new(T::TABLE)),
            _entity: PhantomData,
        }
    }

    pub fn with_spans(mut self, spans: Arc<dyn SpanScope>) -> Self {
        self.spans = spans;
        self
    }

    pub fn repo(&self) -> &R {
        &self.repo
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn cache_keys(&self, entity: &T) -> Vec<String> {
        self.keys.cache_keys(entity)
    }

    async fn traced<F, V>(&self, op: &'static str, fut: F) -> Result<V, ConnError>
    where
        F: Future<Output = Result<V, ConnError>>,
    {
        fut.instrument(self.spans.span(op)).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read-through lookup of `key`; `query` runs on a miss, once per key
    /// across concurrent callers.
    pub async fn query<V, F, Fut>(&self, ctx: &Context, key: &str, query: F) -> Result<V, ConnError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(R) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, RepoError>> + Send + 'static,
    {
        let repo = self.repo.clone();
        self.traced(
            "query",
            self.cache.take(ctx, key, move |ctx| async move {
                query(repo.with_context(&ctx)).await.map_err(ConnError::from)
            }),
        )
        .await
    }

    pub async fn query_no_cache<V, F, Fut>(&self, ctx: &Context, query: F) -> Result<V, ConnError>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<V, RepoError>>,
    {
        let repo = self.repo.with_context(ctx);
        self.traced(
            "query_no_cache",
            ctx.run(async { query(repo).await.map_err(ConnError::from) }),
        )
        .await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Run a write, then invalidate `keys`. A failed write invalidates nothing.
    pub async fn exec<V, F, Fut>(&self, ctx: &Context, exec: F, keys: &[String]) -> Result<V, ConnError>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<V, RepoError>>,
    {
        let repo = self.repo.with_context(ctx);
        self.traced("exec", async {
            let value = ctx
                .run(async { exec(repo).await.map_err(ConnError::from) })
                .await?;
            self.invalidate(ctx, keys).await?;
            Ok(value)
        })
        .await
    }

    /// Run `work` inside a transaction opened on the repository: commit on
    /// success, roll back on any error or when `ctx` ends first.
    pub async fn transaction<V, F, Fut>(&self, ctx: &Context, work: F) -> Result<V, ConnError>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<V, RepoError>>,
    {
        let repo = self.repo.with_context(ctx);
        let tx = repo.begin().await?;
        let outcome = ctx
            .run(async { work(repo.bind_tx(&tx)).await.map_err(ConnError::from) })
            .await;

        match outcome {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        target_module = SOURCE,
                        op = "transaction.rollback",
                        table = T::TABLE,
                        error = %rollback_err,
                        cause = %err,
                        "Rollback failed after error"
                    );
                }
                Err(err)
            }
        }
    }

    /// Delete the deduplicated `keys` in one call.
    ///
    /// Runs detached from the caller's context: once a write has landed its
    /// keys are removed even if the caller has gone away.
    async fn invalidate(&self, ctx: &Context, keys: &[String]) -> Result<(), ConnError> {
        let keys = unique_keys(keys.iter().cloned());
        match self.cache.remove(&ctx.detached(), &keys).await {
            Ok(()) => Ok(()),
            Err(source) => {
                warn!(
                    target_module = SOURCE,
                    op = "invalidate",
                    table = T::TABLE,
                    keys = keys.len(),
                    error = %source,
                    "Cache invalidation failed after write"
                );
                Err(ConnError::Invalidation { keys, source })
            }
        }
    }

    // ========================================================================
    // Cache primitives
    // ========================================================================

    pub async fn get_cache<V>(&self, ctx: &Context, key: &str) -> Result<V, ConnError>
    where
        V: DeserializeOwned,
    {
        self.traced("get_cache", self.cache.get(ctx, key)).await
    }

    pub async fn set_cache<V>(&self, ctx: &Context, key: &str, value: &V) -> Result<(), ConnError>
    where
        V: Serialize + ?Sized,
    {
        self.traced("set_cache", self.cache.set(ctx, key, value))
            .await
    }

    pub async fn set_cache_with_expire<V>(
        &self,
        ctx: &Context,
        key: &str,
        value: &V,
        expire: Duration,
    ) -> Result<(), ConnError>
    where
        V: Serialize + ?Sized,
    {
        self.traced(
            "set_cache_with_expire",
            self.cache.set_with_expire(ctx, key, value, expire),
        )
        .await
    }

    pub async fn del_cache(&self, ctx: &Context, keys: &[String]) -> Result<(), ConnError> {
        self.traced("del_cache", self.cache.del(ctx, keys)).await
    }
}
