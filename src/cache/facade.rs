//! Cache facade over a [`CacheBackend`].
//!
//! Adds what the raw store lacks: JSON encoding, jittered expiry, the
//! not-found placeholder and per-key request coalescing for read-through loads.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::config::CacheConfig;
use super::flight::SingleFlight;
use super::store::{CacheBackend, MemoryBackend};
use super::unstable::Unstable;
use super::{
    CacheError, METRIC_CACHE_FAIL, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_SHARED,
    METRIC_STORE_FAIL, NOT_FOUND_PLACEHOLDER,
};
use crate::context::Context;
use crate::error::ConnError;

const SOURCE: &str = "cache::facade";

type Encoded = Result<Arc<str>, ConnError>;

/// Shared cache handle. Cloning is cheap; clones share backend and in-flight loads.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    backend: Arc<dyn CacheBackend>,
    flights: SingleFlight<Encoded>,
    expiry: Duration,
    not_found_expiry: Duration,
    safety_gap: Duration,
    batch_size: NonZeroUsize,
    unstable: Unstable,
}

enum Lookup {
    Hit(String),
    Placeholder,
    Miss,
}

impl Cache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                backend,
                flights: SingleFlight::new(),
                expiry: config.expiry(),
                not_found_expiry: config.not_found_expiry(),
                safety_gap: config.safety_gap(),
                batch_size: config.batch_size_non_zero(),
                unstable: Unstable::new(config.expiry_deviation),
            }),
        }
    }

    /// A cache over a fresh [`MemoryBackend`] sized from `config`.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::new(Arc::new(MemoryBackend::new(config)), config)
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.inner.backend
    }

    pub fn expiry(&self) -> Duration {
        self.inner.expiry
    }

    pub fn not_found_expiry(&self) -> Duration {
        self.inner.not_found_expiry
    }

    pub fn safety_gap(&self) -> Duration {
        self.inner.safety_gap
    }

    /// Chunk size for batch writes that do not set their own.
    pub fn batch_size(&self) -> NonZeroUsize {
        self.inner.batch_size
    }

    // ========================================================================
    // Primitives
    // ========================================================================

    /// Reads and decodes `key`. Missing keys and the placeholder both yield
    /// [`ConnError::NotFound`].
    pub async fn get<V>(&self, ctx: &Context, key: &str) -> Result<V, ConnError>
    where
        V: DeserializeOwned,
    {
        let raw = ctx
            .run(async { self.inner.backend.get(key).await.map_err(ConnError::from) })
            .await?;
        let Some(raw) = raw else {
            counter!(METRIC_CACHE_MISS).increment(1);
            return Err(ConnError::NotFound);
        };
        counter!(METRIC_CACHE_HIT).increment(1);
        if raw == NOT_FOUND_PLACEHOLDER {
            return Err(ConnError::NotFound);
        }
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.discard_undecodable(key, &err).await;
                Err(ConnError::NotFound)
            }
        }
    }

    /// Stores `value` with the default expiry plus jitter.
    pub async fn set<V>(&self, ctx: &Context, key: &str, value: &V) -> Result<(), ConnError>
    where
        V: Serialize + ?Sized,
    {
        let expire = self.inner.unstable.around(self.inner.expiry);
        self.set_with_expire(ctx, key, value, expire).await
    }

    /// Stores `value` for exactly `expire`.
    pub async fn set_with_expire<V>(
        &self,
        ctx: &Context,
        key: &str,
        value: &V,
        expire: Duration,
    ) -> Result<(), ConnError>
    where
        V: Serialize + ?Sized,
    {
        self.set_until(ctx, key, value, OffsetDateTime::now_utc() + expire)
            .await
    }

    pub(crate) async fn set_until<V>(
        &self,
        ctx: &Context,
        key: &str,
        value: &V,
        expires_at: OffsetDateTime,
    ) -> Result<(), ConnError>
    where
        V: Serialize + ?Sized,
    {
        let payload = serde_json::to_string(value)?;
        ctx.run(async {
            self.inner
                .backend
                .set(key, payload, expires_at)
                .await
                .map_err(ConnError::from)
        })
        .await
    }

    pub async fn del(&self, ctx: &Context, keys: &[String]) -> Result<(), ConnError> {
        self.remove(ctx, keys).await.map_err(ConnError::from)
    }

    /// Deletes `keys` in a single backend call; an empty slice is a no-op.
    pub(crate) async fn remove(&self, ctx: &Context, keys: &[String]) -> Result<(), CacheError> {
        if keys.is_empty() {
            return Ok(());
        }
        ctx.run(self.inner.backend.delete(keys)).await
    }

    // ========================================================================
    // Read-through
    // ========================================================================

    /// Returns the cached value for `key`, or loads it with `query`.
    ///
    /// Concurrent callers for the same key share one load. A load failing
    /// with [`ConnError::NotFound`] stores the placeholder, so later reads
    /// return `NotFound` without calling `query` until it expires.
    pub async fn take<V, F, Fut>(&self, ctx: &Context, key: &str, query: F) -> Result<V, ConnError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ConnError>> + Send + 'static,
    {
        self.take_inner(ctx, key, None, query).await
    }

    /// Like [`Cache::take`], but the expiry instant of the entry is fixed
    /// before loading and handed to `query`, so related entries written by
    /// the loader can be timed against it.
    pub async fn take_with_expire<V, F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        query: F,
    ) -> Result<V, ConnError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Context, OffsetDateTime) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ConnError>> + Send + 'static,
    {
        let expires_at = self.jittered_deadline(self.inner.expiry);
        self.take_inner(ctx, key, Some(expires_at), move |ctx| {
            query(ctx, expires_at)
        })
        .await
    }

    async fn take_inner<V, F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        expires_at: Option<OffsetDateTime>,
        query: F,
    ) -> Result<V, ConnError>
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ConnError>> + Send + 'static,
    {
        let this = self.clone();
        let flight_key = key.to_owned();
        // The load is shared, so it must outlive any single caller's context.
        let detached = ctx.detached();
        let waiting = self.inner.flights.run(key, move || async move {
            this.load_or_fill(&detached, &flight_key, expires_at, query)
                .await
        });

        let (encoded, fresh) = ctx.run(async { Ok::<_, ConnError>(waiting.await) }).await?;
        // Hits and misses are counted once, by the caller that ran the lookup.
        if !fresh {
            counter!(METRIC_CACHE_SHARED).increment(1);
        }
        let raw = encoded?;
        serde_json::from_str(&raw).map_err(ConnError::from)
    }

    async fn load_or_fill<V, F, Fut>(
        &self,
        ctx: &Context,
        key: &str,
        expires_at: Option<OffsetDateTime>,
        query: F,
    ) -> Encoded
    where
        V: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, ConnError>> + Send + 'static,
    {
        match self.lookup::<V>(key).await {
            Lookup::Hit(raw) => return Ok(Arc::from(raw)),
            Lookup::Placeholder => return Err(ConnError::NotFound),
            Lookup::Miss => {}
        }

        let value = match query(ctx.clone()).await {
            Ok(value) => value,
            Err(ConnError::NotFound) => {
                self.store_placeholder(key).await;
                return Err(ConnError::NotFound);
            }
            Err(err) => {
                counter!(METRIC_STORE_FAIL).increment(1);
                return Err(err);
            }
        };

        let payload = serde_json::to_string(&value)?;
        drop(value);
        let expires_at = expires_at.unwrap_or_else(|| self.jittered_deadline(self.inner.expiry));
        if let Err(err) = self
            .inner
            .backend
            .set(key, payload.clone(), expires_at)
            .await
        {
            counter!(METRIC_CACHE_FAIL, "op" => "fill").increment(1);
            warn!(
                target_module = SOURCE,
                op = "fill",
                key,
                error = %err,
                "Cache fill failed; returning loaded value"
            );
        }
        Ok(Arc::from(payload))
    }

    async fn lookup<V>(&self, key: &str) -> Lookup
    where
        V: DeserializeOwned,
    {
        match self.inner.backend.get(key).await {
            Ok(Some(raw)) if raw == NOT_FOUND_PLACEHOLDER => {
                counter!(METRIC_CACHE_HIT).increment(1);
                Lookup::Placeholder
            }
            Ok(Some(raw)) => match serde_json::from_str::<V>(&raw).map(drop) {
                Ok(()) => {
                    counter!(METRIC_CACHE_HIT).increment(1);
                    Lookup::Hit(raw)
                }
                Err(err) => {
                    self.discard_undecodable(key, &err).await;
                    counter!(METRIC_CACHE_MISS).increment(1);
                    Lookup::Miss
                }
            },
            Ok(None) => {
                counter!(METRIC_CACHE_MISS).increment(1);
                Lookup::Miss
            }
            Err(err) => {
                counter!(METRIC_CACHE_FAIL, "op" => "get").increment(1);
                warn!(
                    target_module = SOURCE,
                    op = "lookup",
                    key,
                    error = %err,
                    "Cache lookup failed; loading from repository"
                );
                Lookup::Miss
            }
        }
    }

    async fn store_placeholder(&self, key: &str) {
        let expires_at = self.jittered_deadline(self.inner.not_found_expiry);
        if let Err(err) = self
            .inner
            .backend
            .set(key, NOT_FOUND_PLACEHOLDER.to_owned(), expires_at)
            .await
        {
            counter!(METRIC_CACHE_FAIL, "op" => "placeholder").increment(1);
            warn!(
                target_module = SOURCE,
                op = "placeholder",
                key,
                error = %err,
                "Failed to store not-found placeholder"
            );
        }
    }

    async fn discard_undecodable(&self, key: &str, err: &serde_json::Error) {
        warn!(
            target_module = SOURCE,
            op = "decode",
            key,
            error = %err,
            "Discarding undecodable cache entry"
        );
        if let Err(del_err) = self.inner.backend.delete(&[key.to_owned()]).await {
            debug!(
                target_module = SOURCE,
                op = "decode.delete",
                key,
                error = %del_err,
                "Failed to delete undecodable cache entry"
            );
        }
    }

    fn jittered_deadline(&self, base: Duration) -> OffsetDateTime {
        OffsetDateTime::now_utc() + self.inner.unstable.around(base)
    }
}
