//! In-process repository.
//!
//! Rows live in a shared vector guarded by an `RwLock`. A transaction keeps a
//! log of keyed writes (inserts, upserts, removals) instead of a copy of the
//! table: statements inside it read the live rows with the log laid over
//! them, and `commit` replays the log onto the live rows under the write lock.
//! Writes committed elsewhere while the transaction is open survive; an insert
//! whose key was taken in the meantime fails the commit with `Duplicate`.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::debug;

use super::entity::{Entity, Value};
use super::query::{Assignment, Condition, OrderExpr, QuerySpec};
use super::{RepoError, Repository, TxHandle};
use crate::cache::lock::{mutex_lock, rw_read, rw_write};
use crate::context::Context;

const SOURCE: &str = "repo::memory";

#[derive(Debug, Default)]
struct Counters {
    finds: AtomicU64,
    counts: AtomicU64,
    writes: AtomicU64,
}

/// Statement counters, shared by every handle on the same table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub finds: u64,
    pub counts: u64,
    pub writes: u64,
}

struct Table<T> {
    rows: RwLock<Vec<T>>,
    counters: Counters,
}

/// One keyed change to the table.
enum WriteOp<T> {
    Insert(T),
    Put(T),
    Remove(Value),
}

impl<T: Entity> WriteOp<T> {
    /// With `strict`, an insert onto an existing key fails; otherwise it
    /// overwrites, which is how the log is laid over rows for reading.
    fn apply(&self, rows: &mut Vec<T>, strict: bool) -> Result<(), RepoError> {
        match self {
            Self::Insert(row) | Self::Put(row) => {
                let key = row.primary_key();
                match rows.iter_mut().find(|existing| same_key::<T>(existing, &key)) {
                    Some(_) if strict && matches!(self, Self::Insert(_)) => {
                        return Err(duplicate::<T>());
                    }
                    Some(existing) => *existing = row.clone(),
                    None => rows.push(row.clone()),
                }
            }
            Self::Remove(key) => rows.retain(|row| !same_key(row, key)),
        }
        Ok(())
    }
}

struct TxLog<T> {
    writes: Vec<WriteOp<T>>,
    /// Savepoint names with the log length at the time they were set.
    savepoints: Vec<(String, usize)>,
}

impl<T: Entity> TxLog<T> {
    fn overlay(&self, live: &[T]) -> Vec<T> {
        let mut rows = live.to_vec();
        for write in &self.writes {
            // Lenient application cannot fail.
            let _ = write.apply(&mut rows, false);
        }
        rows
    }
}

struct TxState<T> {
    table: Arc<Table<T>>,
    log: Mutex<Option<TxLog<T>>>,
}

/// Transaction over a [`MemoryRepository`] table.
pub struct MemoryTx<T> {
    state: Arc<TxState<T>>,
}

impl<T> Clone for MemoryTx<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> MemoryTx<T> {
    pub fn is_finished(&self) -> bool {
        mutex_lock(&self.state.log, SOURCE, "tx.is_finished").is_none()
    }

    /// Writes staged so far.
    pub fn pending_writes(&self) -> usize {
        mutex_lock(&self.state.log, SOURCE, "tx.pending_writes")
            .as_ref()
            .map_or(0, |log| log.writes.len())
    }
}

fn finished() -> RepoError {
    RepoError::transaction("transaction already finished")
}

#[async_trait]
impl<T: Entity> TxHandle for MemoryTx<T> {
    async fn commit(&self) -> Result<(), RepoError> {
        let log = mutex_lock(&self.state.log, SOURCE, "tx.commit")
            .take()
            .ok_or_else(finished)?;

        let mut rows = rw_write(&self.state.table.rows, SOURCE, "tx.commit");
        let mut next = rows.clone();
        for write in &log.writes {
            write.apply(&mut next, true)?;
        }
        *rows = next;
        debug!(
            target_module = SOURCE,
            table = T::TABLE,
            writes = log.writes.len(),
            "Committed transaction"
        );
        Ok(())
    }

    async fn rollback(&self) -> Result<(), RepoError> {
        mutex_lock(&self.state.log, SOURCE, "tx.rollback")
            .take()
            .map(drop)
            .ok_or_else(finished)
    }

    async fn savepoint(&self, name: &str) -> Result<(), RepoError> {
        let mut guard = mutex_lock(&self.state.log, SOURCE, "tx.savepoint");
        let log = guard.as_mut().ok_or_else(finished)?;
        let mark = log.writes.len();
        log.savepoints.push((name.to_owned(), mark));
        Ok(())
    }

    async fn rollback_to(&self, name: &str) -> Result<(), RepoError> {
        let mut guard = mutex_lock(&self.state.log, SOURCE, "tx.rollback_to");
        let log = guard.as_mut().ok_or_else(finished)?;
        let position = log
            .savepoints
            .iter()
            .rposition(|(saved, _)| saved == name)
            .ok_or_else(|| RepoError::transaction(format!("savepoint `{name}` does not exist")))?;
        let mark = log.savepoints[position].1;
        log.writes.truncate(mark);
        log.savepoints.truncate(position + 1);
        Ok(())
    }
}

pub struct MemoryRepository<T> {
    table: Arc<Table<T>>,
    tx: Option<MemoryTx<T>>,
    spec: QuerySpec,
    ctx: Context,
}

impl<T> Clone for MemoryRepository<T> {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            tx: self.tx.clone(),
            spec: self.spec.clone(),
            ctx: self.ctx.clone(),
        }
    }
}

impl<T: Entity> Default for MemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> MemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Table {
                rows: RwLock::new(Vec::new()),
                counters: Counters::default(),
            }),
            tx: None,
            spec: QuerySpec::default(),
            ctx: Context::background(),
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let counters = &self.table.counters;
        MemoryStats {
            finds: counters.finds.load(AtomicOrdering::Relaxed),
            counts: counters.counts.load(AtomicOrdering::Relaxed),
            writes: counters.writes.load(AtomicOrdering::Relaxed),
        }
    }

    /// Committed rows, soft-deleted ones included.
    pub fn snapshot(&self) -> Vec<T> {
        rw_read(&self.table.rows, SOURCE, "snapshot").clone()
    }

    pub fn query_spec(&self) -> &QuerySpec {
        &self.spec
    }

    fn with_spec(&self, update: impl FnOnce(&mut QuerySpec)) -> Self {
        let mut next = self.clone();
        update(&mut next.spec);
        next
    }

    fn read<R>(&self, op: &'static str, f: impl FnOnce(&[T]) -> R) -> Result<R, RepoError> {
        if let Some(err) = self.ctx.err() {
            return Err(err.into());
        }
        match &self.tx {
            Some(tx) => {
                let guard = mutex_lock(&tx.state.log, SOURCE, op);
                let log = guard.as_ref().ok_or_else(finished)?;
                let view = log.overlay(&rw_read(&self.table.rows, SOURCE, op));
                Ok(f(&view))
            }
            None => Ok(f(&rw_read(&self.table.rows, SOURCE, op))),
        }
    }

    /// Plan keyed writes against the rows this handle sees, then apply them:
    /// straight to the table, or onto the transaction's log. Returns the
    /// number of rows written.
    fn write(
        &self,
        op: &'static str,
        plan: impl FnOnce(&[T]) -> Result<Vec<WriteOp<T>>, RepoError>,
    ) -> Result<u64, RepoError> {
        if let Some(err) = self.ctx.err() {
            return Err(err.into());
        }
        self.table.counters.writes.fetch_add(1, AtomicOrdering::Relaxed);
        match &self.tx {
            Some(tx) => {
                let mut guard = mutex_lock(&tx.state.log, SOURCE, op);
                let log = guard.as_mut().ok_or_else(finished)?;
                let view = log.overlay(&rw_read(&self.table.rows, SOURCE, op));
                let writes = plan(&view)?;
                let written = writes.len() as u64;
                log.writes.extend(writes);
                Ok(written)
            }
            None => {
                let mut rows = rw_write(&self.table.rows, SOURCE, op);
                let writes = plan(&rows)?;
                let mut next = rows.clone();
                for write in &writes {
                    write.apply(&mut next, true)?;
                }
                *rows = next;
                Ok(writes.len() as u64)
            }
        }
    }

    /// Rows admitted by the query state, ordered, then paged.
    fn select(&self, rows: &[T], tail_order: Option<OrderExpr>) -> Vec<T> {
        let mut selected: Vec<&T> = rows.iter().filter(|row| self.spec.admits(*row)).collect();

        let orders: Vec<&OrderExpr> = self.spec.orders.iter().chain(tail_order.as_ref()).collect();
        if !orders.is_empty() {
            selected.sort_by(|a, b| compare_rows(*a, *b, &orders));
        }

        let offset = self.spec.offset.unwrap_or(0);
        let limit = self.spec.limit.unwrap_or(usize::MAX);
        selected
            .into_iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    async fn single(&self, op: &'static str, order: Option<OrderExpr>) -> Result<T, RepoError> {
        self.table.counters.finds.fetch_add(1, AtomicOrdering::Relaxed);
        let limited = self.limit(1);
        limited
            .read(op, |rows| limited.select(rows, order))?
            .into_iter()
            .next()
            .ok_or(RepoError::NotFound)
    }
}

fn compare_rows<T: Entity>(a: &T, b: &T, orders: &[&OrderExpr]) -> Ordering {
    for order in orders {
        let left = a.column(order.column()).unwrap_or(Value::Null);
        let right = b.column(order.column()).unwrap_or(Value::Null);
        let ordering = left.compare(&right);
        let ordering = if order.is_descending() {
            ordering.reverse()
        } else {
            ordering
        };
        if ordering.is_ne() {
            return ordering;
        }
    }
    Ordering::Equal
}

fn same_key<T: Entity>(a: &T, key: &Value) -> bool {
    a.primary_key().sql_eq(key)
}

fn duplicate<T: Entity>() -> RepoError {
    RepoError::Duplicate {
        constraint: format!("{}_pkey", T::TABLE),
    }
}

/// Soft deletes become upserts of the stamped row; hard deletes are removals.
fn removals<T: Entity>(rows: &[T], doomed: impl Fn(&T) -> bool) -> Vec<WriteOp<T>> {
    let now = OffsetDateTime::now_utc();
    rows.iter()
        .filter(|row| doomed(row))
        .map(|row| match T::SOFT_DELETE {
            Some(_) => {
                let mut stamped = row.clone();
                stamped.mark_deleted(now);
                WriteOp::Put(stamped)
            }
            None => WriteOp::Remove(row.primary_key()),
        })
        .collect()
}

#[async_trait]
impl<T: Entity> Repository<T> for MemoryRepository<T> {
    type Tx = MemoryTx<T>;

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
        if let Some(err) = self.ctx.err() {
            return Err(err.into());
        }
        Ok(MemoryTx {
            state: Arc::new(TxState {
                table: Arc::clone(&self.table),
                log: Mutex::new(Some(TxLog {
                    writes: Vec::new(),
                    savepoints: Vec::new(),
                })),
            }),
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
        self.single("first", Some(OrderExpr::asc(T::PRIMARY_KEY)))
            .await
    }

    async fn take(&self) -> Result<T, RepoError> {
        self.single("take", None).await
    }

    async fn last(&self) -> Result<T, RepoError> {
        self.single("last", Some(OrderExpr::desc(T::PRIMARY_KEY)))
            .await
    }

    async fn find(&self) -> Result<Vec<T>, RepoError> {
        self.table.counters.finds.fetch_add(1, AtomicOrdering::Relaxed);
        self.read("find", |rows| self.select(rows, None))
    }

    async fn count(&self) -> Result<u64, RepoError> {
        self.table.counters.counts.fetch_add(1, AtomicOrdering::Relaxed);
        self.read("count", |rows| {
            rows.iter().filter(|row| self.spec.admits(*row)).count() as u64
        })
    }

    async fn create(&self, rows: &[T]) -> Result<(), RepoError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.write("create", |table| {
            for (index, row) in rows.iter().enumerate() {
                let key = row.primary_key();
                let clashes_with_table = table.iter().any(|existing| same_key(existing, &key));
                let clashes_with_input = rows[..index].iter().any(|earlier| same_key(earlier, &key));
                if clashes_with_table || clashes_with_input {
                    return Err(duplicate::<T>());
                }
            }
            Ok(rows.iter().cloned().map(WriteOp::Insert).collect())
        })
        .map(drop)
    }

    async fn save(&self, rows: &[T]) -> Result<(), RepoError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.write("save", |_| Ok(rows.iter().cloned().map(WriteOp::Put).collect()))
            .map(drop)
    }

    async fn delete(&self, rows: &[T]) -> Result<u64, RepoError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let keys: Vec<Value> = rows.iter().map(Entity::primary_key).collect();
        self.write("delete", |table| {
            Ok(removals(table, |row| {
                self.spec.admits(row) && keys.iter().any(|key| same_key(row, key))
            }))
        })
    }

    async fn delete_matching(&self) -> Result<u64, RepoError> {
        if self.spec.conditions.is_empty() {
            return Err(RepoError::invalid_input(
                "refusing to delete without conditions",
            ));
        }
        self.write("delete_matching", |table| {
            Ok(removals(table, |row| self.spec.admits(row)))
        })
    }

    async fn update(&self, assignments: &[Assignment]) -> Result<u64, RepoError> {
        if assignments.is_empty() {
            return Ok(0);
        }
        self.spec.check_update::<T>(assignments)?;
        self.write("update", |table| {
            table
                .iter()
                .filter(|row| self.spec.admits(*row))
                .map(|row| -> Result<WriteOp<T>, RepoError> {
                    let mut changed = row.clone();
                    for assignment in assignments {
                        changed.set_column(assignment.column(), assignment.value())?;
                    }
                    Ok(WriteOp::Put(changed))
                })
                .collect()
        })
    }
}
