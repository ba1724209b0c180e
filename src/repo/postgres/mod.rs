//! Postgres-backed repository.

mod sql;
mod util;

pub use util::map_sqlx_error;

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{
    Postgres, QueryBuilder, Transaction,
    postgres::{PgPool, PgPoolOptions},
    query,
};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::entity::{Entity, Value};
use super::query::{Assignment, Condition, OrderExpr, QuerySpec};
use super::{RepoError, Repository, TxHandle};
use crate::context::Context;

/// Shared handle on an open Postgres transaction.
#[derive(Clone)]
pub struct PgTx {
    inner: Arc<Mutex<Option<Transaction<'static, Postgres>>>>,
}

impl PgTx {
    fn finished() -> RepoError {
        RepoError::transaction("transaction already finished")
    }

    async fn run_control(&self, mut qb: QueryBuilder<'static, Postgres>) -> Result<(), RepoError> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or_else(Self::finished)?;
        qb.build()
            .execute(tx.as_mut())
            .await
            .map(drop)
            .map_err(map_sqlx_error)
    }
}

#[async_trait]
impl TxHandle for PgTx {
    async fn commit(&self) -> Result<(), RepoError> {
        let tx = self.inner.lock().await.take().ok_or_else(Self::finished)?;
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&self) -> Result<(), RepoError> {
        let tx = self.inner.lock().await.take().ok_or_else(Self::finished)?;
        tx.rollback().await.map_err(map_sqlx_error)
    }

    async fn savepoint(&self, name: &str) -> Result<(), RepoError> {
        self.run_control(sql::savepoint(name)?).await
    }

    async fn rollback_to(&self, name: &str) -> Result<(), RepoError> {
        self.run_control(sql::rollback_to(name)?).await
    }
}

pub struct PgRepository<T> {
    pool: Arc<PgPool>,
    tx: Option<PgTx>,
    spec: QuerySpec,
    ctx: Context,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for PgRepository<T> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            tx: self.tx.clone(),
            spec: self.spec.clone(),
            ctx: self.ctx.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> PgRepository<T> {
    pub fn new(pool: PgPool) -> Self {
        Self::from_shared(Arc::new(pool))
    }

    /// Another entity's repository on the same pool.
    pub fn from_shared(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            tx: None,
            spec: QuerySpec::default(),
            ctx: Context::background(),
            _entity: PhantomData,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn shared_pool(&self) -> Arc<PgPool> {
        Arc::clone(&self.pool)
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, RepoError> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(map_sqlx_error)
    }

    pub async fn health_check(&self) -> Result<(), RepoError> {
        query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }

    fn with_spec(&self, update: impl FnOnce(&mut QuerySpec)) -> Self {
        let mut next = self.clone();
        update(&mut next.spec);
        next
    }

    async fn fetch_rows(&self, mut qb: QueryBuilder<'static, Postgres>) -> Result<Vec<T>, RepoError> {
        let statement = qb.build_query_scalar::<JsonValue>();
        let rows = self
            .ctx
            .run(async {
                match &self.tx {
                    Some(tx) => {
                        let mut guard = tx.inner.lock().await;
                        let conn = guard.as_mut().ok_or_else(PgTx::finished)?;
                        statement.fetch_all(conn.as_mut()).await.map_err(map_sqlx_error)
                    }
                    None => statement
                        .fetch_all(self.pool())
                        .await
                        .map_err(map_sqlx_error),
                }
            })
            .await?;

        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row).map_err(|err| {
                    RepoError::from_persistence(format!("{} row decode failed: {err}", T::TABLE))
                })
            })
            .collect()
    }

    async fn fetch_count(&self, mut qb: QueryBuilder<'static, Postgres>) -> Result<u64, RepoError> {
        let statement = qb.build_query_scalar::<i64>();
        let count = self
            .ctx
            .run(async {
                match &self.tx {
                    Some(tx) => {
                        let mut guard = tx.inner.lock().await;
                        let conn = guard.as_mut().ok_or_else(PgTx::finished)?;
                        statement.fetch_one(conn.as_mut()).await.map_err(map_sqlx_error)
                    }
                    None => statement.fetch_one(self.pool()).await.map_err(map_sqlx_error),
                }
            })
            .await?;
        count
            .try_into()
            .map_err(|_| RepoError::from_persistence("count exceeds supported range"))
    }

    async fn execute(&self, mut qb: QueryBuilder<'static, Postgres>) -> Result<u64, RepoError> {
        let statement = qb.build();
        let result = self
            .ctx
            .run(async {
                match &self.tx {
                    Some(tx) => {
                        let mut guard = tx.inner.lock().await;
                        let conn = guard.as_mut().ok_or_else(PgTx::finished)?;
                        statement.execute(conn.as_mut()).await.map_err(map_sqlx_error)
                    }
                    None => statement.execute(self.pool()).await.map_err(map_sqlx_error),
                }
            })
            .await?;
        Ok(result.rows_affected())
    }

    async fn single(&self, order: Option<OrderExpr>) -> Result<T, RepoError> {
        let limited = self.limit(1);
        self.fetch_rows(sql::select::<T>(&limited.spec, order))
            .await?
            .into_iter()
            .next()
            .ok_or(RepoError::NotFound)
    }
}

#[async_trait]
impl<T: Entity> Repository<T> for PgRepository<T> {
    type Tx = PgTx;

    fn with_context(&self, ctx: &Context) -> Self {
        let mut next = self.clone();
        next.ctx = ctx.clone();
        next
    }

    fn bind_tx(&self, tx: &Self::Tx) -> Self {
        let mut next = self.clone();
        next.tx = Some(tx.clone());
        next
    }

    async fn begin(&self) -> Result<Self::Tx, RepoError> {
        if self.tx.is_some() {
            return Err(RepoError::transaction("handle is already bound to a transaction"));
        }
        let tx = self
            .ctx
            .run(async { self.pool.begin().await.map_err(map_sqlx_error) })
            .await?;
        Ok(PgTx {
            inner: Arc::new(Mutex::new(Some(tx))),
        })
    }

    fn filter(&self, condition: Condition) -> Self {
        self.with_spec(|spec| spec.conditions.push(condition))
    }

    fn order(&self, order: OrderExpr) -> Self {
        self.with_spec(|spec| spec.orders.push(order))
    }

    fn offset(&self, offset: usize) -> Self {
        self.with_spec(|spec| spec.offset = Some(offset))
    }

    fn limit(&self, limit: usize) -> Self {
        self.with_spec(|spec| spec.limit = Some(limit))
    }

    fn clear_page(&self) -> Self {
        self.with_spec(|spec| {
            spec.offset = None;
            spec.limit = None;
        })
    }

    fn clear_orders(&self) -> Self {
        self.with_spec(|spec| spec.orders.clear())
    }

    fn unscoped(&self) -> Self {
        self.with_spec(|spec| spec.unscoped = true)
    }

    async fn first(&self) -> Result<T, RepoError> {
        self.single(Some(OrderExpr::asc(T::PRIMARY_KEY))).await
    }

    async fn take(&self) -> Result<T, RepoError> {
        self.single(None).await
    }

    async fn last(&self) -> Result<T, RepoError> {
        self.single(Some(OrderExpr::desc(T::PRIMARY_KEY))).await
    }

    async fn find(&self) -> Result<Vec<T>, RepoError> {
        self.fetch_rows(sql::select::<T>(&self.spec, None)).await
    }

    async fn count(&self) -> Result<u64, RepoError> {
        self.fetch_count(sql::count::<T>(&self.spec)).await
    }

    async fn create(&self, rows: &[T]) -> Result<(), RepoError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.execute(sql::insert(rows, false)?).await.map(|_| ())
    }

    async fn save(&self, rows: &[T]) -> Result<(), RepoError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.execute(sql::insert(rows, true)?).await.map(|_| ())
    }

    async fn delete(&self, rows: &[T]) -> Result<u64, RepoError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let keys: Vec<Value> = rows.iter().map(Entity::primary_key).collect();
        self.execute(sql::delete::<T>(
            &self.spec,
            Some(keys.as_slice()),
            OffsetDateTime::now_utc(),
        ))
        .await
    }

    async fn delete_matching(&self) -> Result<u64, RepoError> {
        if self.spec.conditions.is_empty() {
            return Err(RepoError::invalid_input(
                "refusing to delete without conditions",
            ));
        }
        self.execute(sql::delete::<T>(&self.spec, None, OffsetDateTime::now_utc()))
            .await
    }

    async fn update(&self, assignments: &[Assignment]) -> Result<u64, RepoError> {
        if assignments.is_empty() {
            return Ok(0);
        }
        self.spec.check_update::<T>(assignments)?;
        self.execute(sql::update::<T>(&self.spec, assignments)).await
    }
}
