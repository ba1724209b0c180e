//! Two-level lookup: a secondary key caches the primary id, the primary key
//! caches the row.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use tracing::warn;

use super::{CachedConn, SOURCE};
use crate::cache::CacheKeyProvider;
use crate::cache::lock::mutex_lock;
use crate::context::Context;
use crate::error::ConnError;
use crate::repo::{Entity, RepoError, Repository};

impl<T, R, P> CachedConn<T, R, P>
where
    T: Entity,
    R: Repository<T>,
    P: CacheKeyProvider<T> + 'static,
{
    /// Resolve `key` to a primary id, then the id to a row.
    ///
    /// On an index miss `index_query` returns both id and row. The row is
    /// cached under `keyer(id)` until the index entry's deadline plus the
    /// safety gap, so the index never outlives the row it points at, and it
    /// is returned without a second lookup. On an index hit the row is read
    /// through `keyer(id)`, with `primary_query` as the loader.
    pub async fn query_row_index<K, KF, IQ, IFut, PQ, PFut>(
        &self,
        ctx: &Context,
        key: &str,
        keyer: KF,
        index_query: IQ,
        primary_query: PQ,
    ) -> Result<T, ConnError>
    where
        K: Serialize + DeserializeOwned + Send + 'static,
        KF: Fn(&K) -> String + Send + Sync + 'static,
        IQ: FnOnce(R) -> IFut + Send + 'static,
        IFut: Future<Output = Result<(K, T), RepoError>> + Send + 'static,
        PQ: FnOnce(R, K) -> PFut + Send + 'static,
        PFut: Future<Output = Result<T, RepoError>> + Send + 'static,
    {
        let keyer = Arc::new(keyer);
        let loaded: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));

        let fill_keyer = Arc::clone(&keyer);
        let fill_slot = Arc::clone(&loaded);
        let cache = self.cache.clone();
        let repo = self.repo.clone();
        let index_load = move |ctx: Context, index_expires_at: OffsetDateTime| async move {
            let (primary, row) = index_query(repo.with_context(&ctx)).await?;
            let row_key = fill_keyer(&primary);
            let row_expires_at = index_expires_at + cache.safety_gap();
            if let Err(err) = cache.set_until(&ctx, &row_key, &row, row_expires_at).await {
                warn!(
                    target_module = SOURCE,
                    op = "query_row_index.fill",
                    key = %row_key,
                    error = %err,
                    "Caching row behind index failed"
                );
            }
            *mutex_lock(&fill_slot, SOURCE, "query_row_index.fill") = Some(row);
            Ok::<K, ConnError>(primary)
        };

        self.traced("query_row_index", async {
            let primary: K = self.cache.take_with_expire(ctx, key, index_load).await?;

            let row = mutex_lock(&loaded, SOURCE, "query_row_index.take").take();
            if let Some(row) = row {
                return Ok(row);
            }

            let repo = self.repo.clone();
            let row_key = keyer(&primary);
            self.cache
                .take(ctx, &row_key, move |ctx| async move {
                    primary_query(repo.with_context(&ctx), primary)
                        .await
                        .map_err(ConnError::from)
                })
                .await
        })
        .await
    }
}
