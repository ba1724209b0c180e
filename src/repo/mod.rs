//! Generic repository abstraction.
//!
//! A [`Repository`] handle carries its query state (conditions, ordering,
//! paging, soft-delete scope) plus the [`Context`] and optional transaction it
//! is bound to. Every builder step returns a new handle; the receiver is never
//! mutated, so handles can be shared across tasks freely.

mod entity;
pub mod memory;
pub mod postgres;
pub mod query;

use std::future::Future;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::{Context, ContextError};

pub use entity::{Entity, Value};
pub use memory::{MemoryRepository, MemoryStats, MemoryTx};
pub use postgres::{PgRepository, PgTx, map_sqlx_error};
pub use query::{Assignment, Condition, Op, OrderExpr, QuerySpec};

#[derive(Debug, Clone, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("operation cancelled")]
    Cancelled,
    #[error("transaction error: {message}")]
    Transaction { message: String },
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }
}

impl From<ContextError> for RepoError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Cancelled => Self::Cancelled,
            ContextError::DeadlineExceeded => Self::Timeout,
        }
    }
}

/// Handle on an open transaction. Clones refer to the same transaction;
/// finishing it through any clone finishes it for all.
#[async_trait]
pub trait TxHandle: Clone + Send + Sync + 'static {
    async fn commit(&self) -> Result<(), RepoError>;

    async fn rollback(&self) -> Result<(), RepoError>;

    /// Mark a point inside the transaction that [`TxHandle::rollback_to`] can
    /// return to. Reusing a name shadows the earlier savepoint.
    async fn savepoint(&self, name: &str) -> Result<(), RepoError>;

    /// Undo every statement run after savepoint `name`. The savepoint itself
    /// stays usable; savepoints set after it are released.
    async fn rollback_to(&self, name: &str) -> Result<(), RepoError>;
}

#[async_trait]
pub trait Repository<T: Entity>: Clone + Send + Sync + 'static {
    type Tx: TxHandle;

    // Binding

    fn with_context(&self, ctx: &Context) -> Self;

    /// Route every statement of the returned handle through `tx`.
    fn bind_tx(&self, tx: &Self::Tx) -> Self;

    async fn begin(&self) -> Result<Self::Tx, RepoError>;

    // Query state

    fn filter(&self, condition: Condition) -> Self;

    fn order(&self, order: OrderExpr) -> Self;

    fn offset(&self, offset: usize) -> Self;

    fn limit(&self, limit: usize) -> Self;

    /// Drop offset and limit, e.g. before counting the full result set.
    fn clear_page(&self) -> Self;

    fn clear_orders(&self) -> Self;

    /// Include soft-deleted rows.
    fn unscoped(&self) -> Self;

    fn filters<I>(&self, conditions: I) -> Self
    where
        I: IntoIterator<Item = Condition>,
    {
        conditions
            .into_iter()
            .fold(self.clone(), |repo, condition| repo.filter(condition))
    }

    fn filter_opt(&self, condition: Option<Condition>) -> Self {
        match condition {
            Some(condition) => self.filter(condition),
            None => self.clone(),
        }
    }

    fn orders<I>(&self, orders: I) -> Self
    where
        I: IntoIterator<Item = OrderExpr>,
    {
        orders
            .into_iter()
            .fold(self.clone(), |repo, order| repo.order(order))
    }

    // Reads

    /// First row by primary key ascending.
    async fn first(&self) -> Result<T, RepoError>;

    /// Any matching row, in no particular order.
    async fn take(&self) -> Result<T, RepoError>;

    /// Last row by primary key.
    async fn last(&self) -> Result<T, RepoError>;

    /// All matching rows; an empty result is not an error.
    async fn find(&self) -> Result<Vec<T>, RepoError>;

    async fn count(&self) -> Result<u64, RepoError>;

    /// One page plus the total row count.
    ///
    /// A short, non-empty page is the last one, so its total is derived
    /// without a count query.
    async fn find_by_page(
        &self,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<(Vec<T>, u64), RepoError> {
        let mut paged = self.offset(offset);
        if let Some(limit) = limit {
            paged = paged.limit(limit);
        }
        let rows = paged.find().await?;

        let short_page = limit.is_some_and(|limit| 0 < rows.len() && rows.len() < limit);
        if short_page {
            let total = (offset + rows.len()) as u64;
            return Ok((rows, total));
        }

        let total = self.clear_page().count().await?;
        Ok((rows, total))
    }

    /// Hand every matching row to `each`, `batch_size` rows at a time, walking
    /// the primary key upwards. Paging and ordering on the handle are ignored.
    /// Returns the number of rows visited; an error from `each` stops the walk.
    async fn find_in_batches<F, Fut>(
        &self,
        batch_size: NonZeroUsize,
        mut each: F,
    ) -> Result<u64, RepoError>
    where
        F: FnMut(Vec<T>) -> Fut + Send,
        Fut: Future<Output = Result<(), RepoError>> + Send,
    {
        let walk = self
            .clear_page()
            .clear_orders()
            .order(OrderExpr::asc(T::PRIMARY_KEY))
            .limit(batch_size.get());
        let mut after: Option<Value> = None;
        let mut visited = 0;
        loop {
            let page = match after.take() {
                Some(key) => walk.filter(Condition::gt(T::PRIMARY_KEY, key)),
                None => walk.clone(),
            };
            let rows = page.find().await?;
            let Some(last) = rows.last() else {
                break;
            };
            after = Some(last.primary_key());
            let fetched = rows.len();
            visited += fetched as u64;
            each(rows).await?;
            if fetched < batch_size.get() {
                break;
            }
        }
        Ok(visited)
    }

    /// The first matching row, or `row` when nothing matches. Nothing is written.
    async fn first_or_init(&self, row: T) -> Result<T, RepoError> {
        match self.first().await {
            Err(RepoError::NotFound) => Ok(row),
            found => found,
        }
    }

    /// The first matching row, or `row` after inserting it when nothing matches.
    async fn first_or_create(&self, row: T) -> Result<T, RepoError> {
        match self.first().await {
            Err(RepoError::NotFound) => {
                self.create(std::slice::from_ref(&row)).await?;
                Ok(row)
            }
            found => found,
        }
    }

    // Writes

    /// Insert `rows`; an empty slice is a no-op.
    async fn create(&self, rows: &[T]) -> Result<(), RepoError>;

    async fn create_in_batches(&self, rows: &[T], batch_size: NonZeroUsize) -> Result<(), RepoError> {
        for chunk in rows.chunks(batch_size.get()) {
            self.create(chunk).await?;
        }
        Ok(())
    }

    /// Upsert `rows`; existing rows are overwritten in full.
    async fn save(&self, rows: &[T]) -> Result<(), RepoError>;

    /// Delete `rows` by primary key, soft when the entity supports it.
    async fn delete(&self, rows: &[T]) -> Result<u64, RepoError>;

    /// Delete every row admitted by the current conditions.
    async fn delete_matching(&self) -> Result<u64, RepoError>;

    /// Set `assignments` on every row admitted by the current conditions and
    /// return how many rows changed. Refused without conditions; an empty
    /// assignment list is a no-op.
    async fn update(&self, assignments: &[Assignment]) -> Result<u64, RepoError>;

    async fn update_column(&self, column: &str, value: Value) -> Result<u64, RepoError> {
        self.update(&[Assignment::new(column, value)]).await
    }
}
