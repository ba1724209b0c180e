//! Batch writes.
//!
//! Every batch derives the cache keys of all its rows before writing, runs
//! the writes in `batch_size` chunks, and invalidates the combined key set
//! once at the end. Without a caller-supplied transaction the whole batch
//! runs in one internal transaction; with one, the caller owns commit and
//! rollback.

use std::future::Future;
use std::num::NonZeroUsize;

use tracing::debug;

use super::{CachedConn, SOURCE};
use crate::cache::{CacheKeyProvider, keys_for_many};
use crate::context::Context;
use crate::error::ConnError;
use crate::repo::{Entity, RepoError, Repository};

/// Options shared by the batch operations.
///
/// Without an explicit batch size the connection's configured
/// `cache.batch_size` applies.
#[derive(Debug, Clone)]
pub struct BatchOptions<Tx> {
    batch_size: Option<NonZeroUsize>,
    tx: Option<Tx>,
    clean_keys: Vec<String>,
}

impl<Tx> Default for BatchOptions<Tx> {
    fn default() -> Self {
        Self {
            batch_size: None,
            tx: None,
            clean_keys: Vec::new(),
        }
    }
}

impl<Tx> BatchOptions<Tx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A size of zero is treated as one.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN));
        self
    }

    /// Run inside the caller's transaction; the batch never commits or rolls it back.
    pub fn with_tx(mut self, tx: Tx) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Extra keys to invalidate alongside those derived from the rows.
    pub fn with_clean_keys<I>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.clean_keys.extend(keys);
        self
    }

    /// The explicit chunk size, if one was set.
    pub fn batch_size(&self) -> Option<NonZeroUsize> {
        self.batch_size
    }

    pub fn tx(&self) -> Option<&Tx> {
        self.tx.as_ref()
    }

    pub fn clean_keys(&self) -> &[String] {
        &self.clean_keys
    }
}

impl<T, R, P> CachedConn<T, R, P>
where
    T: Entity,
    R: Repository<T>,
    P: CacheKeyProvider<T> + 'static,
{
    /// Insert `rows` with the repository's native batched insert.
    pub async fn batch_create(
        &self,
        ctx: &Context,
        rows: &[T],
        opts: BatchOptions<R::Tx>,
    ) -> Result<(), ConnError> {
        let size = self.chunk_size(&opts);
        self.traced(
            "batch_create",
            self.run_batch(ctx, rows, opts, |repo| async move {
                repo.create_in_batches(rows, size).await
            }),
        )
        .await
    }

    /// Apply `update` to each row in turn.
    pub async fn batch_update<F, Fut>(
        &self,
        ctx: &Context,
        rows: &[T],
        update: F,
        opts: BatchOptions<R::Tx>,
    ) -> Result<(), ConnError>
    where
        F: Fn(R, T) -> Fut,
        Fut: Future<Output = Result<(), RepoError>>,
    {
        self.traced("batch_update", self.per_row(ctx, rows, update, opts))
            .await
    }

    /// Apply `delete` to each row in turn.
    pub async fn batch_delete<F, Fut>(
        &self,
        ctx: &Context,
        rows: &[T],
        delete: F,
        opts: BatchOptions<R::Tx>,
    ) -> Result<(), ConnError>
    where
        F: Fn(R, T) -> Fut,
        Fut: Future<Output = Result<(), RepoError>>,
    {
        self.traced("batch_delete", self.per_row(ctx, rows, delete, opts))
            .await
    }

    /// Hand each chunk of at most `batch_size` rows to `create`.
    pub async fn batch_create_custom<F, Fut>(
        &self,
        ctx: &Context,
        rows: &[T],
        create: F,
        opts: BatchOptions<R::Tx>,
    ) -> Result<(), ConnError>
    where
        F: Fn(R, Vec<T>) -> Fut,
        Fut: Future<Output = Result<(), RepoError>>,
    {
        let size = self.chunk_size(&opts).get();
        self.traced(
            "batch_create_custom",
            self.run_batch(ctx, rows, opts, |repo| async move {
                for chunk in rows.chunks(size) {
                    create(repo.clone(), chunk.to_vec()).await?;
                }
                Ok(())
            }),
        )
        .await
    }

    /// Run `exec` on a handle bound to `opts.tx` (if any), then invalidate
    /// `opts.clean_keys`. No transaction is opened here.
    pub async fn exec_batch<V, F, Fut>(
        &self,
        ctx: &Context,
        exec: F,
        opts: BatchOptions<R::Tx>,
    ) -> Result<V, ConnError>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<V, RepoError>>,
    {
        let BatchOptions { tx, clean_keys, .. } = opts;
        let mut repo = self.repo.with_context(ctx);
        if let Some(tx) = tx.as_ref() {
            repo = repo.bind_tx(tx);
        }
        self.traced("exec_batch", async {
            let value = ctx
                .run(async { exec(repo).await.map_err(ConnError::from) })
                .await?;
            self.invalidate(ctx, &clean_keys).await?;
            Ok(value)
        })
        .await
    }

    fn chunk_size(&self, opts: &BatchOptions<R::Tx>) -> NonZeroUsize {
        opts.batch_size.unwrap_or_else(|| self.cache.batch_size())
    }

    async fn per_row<F, Fut>(
        &self,
        ctx: &Context,
        rows: &[T],
        apply: F,
        opts: BatchOptions<R::Tx>,
    ) -> Result<(), ConnError>
    where
        F: Fn(R, T) -> Fut,
        Fut: Future<Output = Result<(), RepoError>>,
    {
        let size = self.chunk_size(&opts).get();
        self.run_batch(ctx, rows, opts, |repo| async move {
            for chunk in rows.chunks(size) {
                for row in chunk {
                    apply(repo.clone(), row.clone()).await?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn run_batch<F, Fut>(
        &self,
        ctx: &Context,
        rows: &[T],
        opts: BatchOptions<R::Tx>,
        work: F,
    ) -> Result<(), ConnError>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<(), RepoError>>,
    {
        let BatchOptions { tx, clean_keys, .. } = opts;
        let mut keys = keys_for_many(self.keys.as_ref(), rows);
        keys.extend(clean_keys);

        match tx {
            Some(tx) => {
                let repo = self.repo.with_context(ctx).bind_tx(&tx);
                ctx.run(async { work(repo).await.map_err(ConnError::from) })
                    .await?;
            }
            None => self.transaction(ctx, work).await?,
        }

        debug!(
            target_module = SOURCE,
            op = "batch",
            table = T::TABLE,
            rows = rows.len(),
            keys = keys.len(),
            "Batch applied; invalidating keys"
        );
        self.invalidate(ctx, &keys).await
    }
}
