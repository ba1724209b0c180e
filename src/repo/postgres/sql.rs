//! Statement builders driven by [`Entity`] metadata.
//!
//! Rows are read back as `to_jsonb(t)` so any serde-deserializable entity can
//! be loaded without a per-type `FromRow` impl.

use sqlx::{Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::repo::entity::{Entity, Value};
use crate::repo::query::{Assignment, Condition, Op, OrderExpr, QuerySpec};
use crate::repo::RepoError;

pub(super) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &Value) {
    match value {
        Value::Null => {
            qb.push("NULL");
        }
        Value::Bool(value) => {
            qb.push_bind(*value);
        }
        Value::Int(value) => {
            qb.push_bind(*value);
        }
        Value::Float(value) => {
            qb.push_bind(*value);
        }
        Value::Text(value) => {
            qb.push_bind(value.clone());
        }
        Value::Uuid(value) => {
            qb.push_bind(*value);
        }
        Value::Timestamp(value) => {
            qb.push_bind(*value);
        }
    }
}

fn push_condition(qb: &mut QueryBuilder<'static, Postgres>, condition: &Condition) {
    let column = quote_ident(condition.column());
    match condition.op() {
        Op::IsNull | Op::NotNull => {
            qb.push(format!("{column} {}", condition.op().as_sql()));
        }
        Op::In if condition.values().is_empty() => {
            qb.push("FALSE");
        }
        Op::In => {
            qb.push(format!("{column} IN ("));
            for (index, value) in condition.values().iter().enumerate() {
                if index > 0 {
                    qb.push(", ");
                }
                push_value(qb, value);
            }
            qb.push(")");
        }
        op => {
            qb.push(format!("{column} {} ", op.as_sql()));
            match condition.values().first() {
                Some(value) => push_value(qb, value),
                None => {
                    qb.push("NULL");
                }
            }
        }
    }
}

/// `WHERE` clause for the conditions plus the soft-delete scope.
fn push_where<T: Entity>(
    qb: &mut QueryBuilder<'static, Postgres>,
    spec: &QuerySpec,
    keys: Option<&[Value]>,
) {
    let mut first = true;
    let mut next = |qb: &mut QueryBuilder<'static, Postgres>| {
        qb.push(if first { " WHERE " } else { " AND " });
        first = false;
    };

    if let (Some(column), false) = (T::SOFT_DELETE, spec.unscoped) {
        next(qb);
        qb.push(format!("{} IS NULL", quote_ident(column)));
    }
    if let Some(keys) = keys {
        next(qb);
        push_condition(qb, &Condition::in_list(T::PRIMARY_KEY, keys.iter().cloned()));
    }
    for condition in &spec.conditions {
        next(qb);
        push_condition(qb, condition);
    }
}

fn push_order(qb: &mut QueryBuilder<'static, Postgres>, orders: &[&OrderExpr]) {
    for (index, order) in orders.iter().enumerate() {
        qb.push(if index == 0 { " ORDER BY " } else { ", " });
        qb.push(quote_ident(order.column()));
        qb.push(if order.is_descending() { " DESC" } else { " ASC" });
    }
}

pub(super) fn select<T: Entity>(
    spec: &QuerySpec,
    tail_order: Option<OrderExpr>,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT to_jsonb(t) FROM ");
    qb.push(quote_ident(T::TABLE));
    qb.push(" AS t");
    push_where::<T>(&mut qb, spec, None);

    let orders: Vec<&OrderExpr> = spec.orders.iter().chain(tail_order.as_ref()).collect();
    push_order(&mut qb, &orders);

    if let Some(limit) = spec.limit {
        qb.push(" LIMIT ");
        qb.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
    }
    if let Some(offset) = spec.offset.filter(|offset| *offset > 0) {
        qb.push(" OFFSET ");
        qb.push_bind(i64::try_from(offset).unwrap_or(i64::MAX));
    }
    qb
}

pub(super) fn count<T: Entity>(spec: &QuerySpec) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT COUNT(*) FROM ");
    qb.push(quote_ident(T::TABLE));
    qb.push(" AS t");
    push_where::<T>(&mut qb, spec, None);
    qb
}

/// Multi-row `INSERT`; with `upsert`, conflicting rows are overwritten in full.
pub(super) fn insert<T: Entity>(
    rows: &[T],
    upsert: bool,
) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    let columns: Vec<String> = T::COLUMNS.iter().map(|column| quote_ident(column)).collect();

    let mut qb = QueryBuilder::new("INSERT INTO ");
    qb.push(quote_ident(T::TABLE));
    qb.push(format!(" ({}) VALUES ", columns.join(", ")));

    for (row_index, row) in rows.iter().enumerate() {
        qb.push(if row_index == 0 { "(" } else { ", (" });
        for (index, column) in T::COLUMNS.iter().enumerate() {
            if index > 0 {
                qb.push(", ");
            }
            let value = row.column(column).ok_or_else(|| {
                RepoError::invalid_input(format!("{} has no column `{column}`", T::TABLE))
            })?;
            push_value(&mut qb, &value);
        }
        qb.push(")");
    }

    if upsert {
        qb.push(format!(" ON CONFLICT ({}) DO ", quote_ident(T::PRIMARY_KEY)));
        let assignments: Vec<String> = T::COLUMNS
            .iter()
            .filter(|column| **column != T::PRIMARY_KEY)
            .map(|column| {
                let column = quote_ident(column);
                format!("{column} = EXCLUDED.{column}")
            })
            .collect();
        if assignments.is_empty() {
            qb.push("NOTHING");
        } else {
            qb.push(format!("UPDATE SET {}", assignments.join(", ")));
        }
    }
    Ok(qb)
}

/// Soft or hard delete of the rows admitted by `spec`, optionally narrowed to `keys`.
pub(super) fn delete<T: Entity>(
    spec: &QuerySpec,
    keys: Option<&[Value]>,
    now: OffsetDateTime,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = match T::SOFT_DELETE {
        Some(column) => {
            let mut qb = QueryBuilder::new("UPDATE ");
            qb.push(quote_ident(T::TABLE));
            qb.push(format!(" SET {} = ", quote_ident(column)));
            qb.push_bind(now);
            qb
        }
        None => {
            let mut qb = QueryBuilder::new("DELETE FROM ");
            qb.push(quote_ident(T::TABLE));
            qb
        }
    };
    push_where::<T>(&mut qb, spec, keys);
    qb
}

/// `UPDATE ... SET` of `assignments` on the rows admitted by `spec`.
pub(super) fn update<T: Entity>(
    spec: &QuerySpec,
    assignments: &[Assignment],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("UPDATE ");
    qb.push(quote_ident(T::TABLE));
    for (index, assignment) in assignments.iter().enumerate() {
        qb.push(if index == 0 { " SET " } else { ", " });
        qb.push(format!("{} = ", quote_ident(assignment.column())));
        push_value(&mut qb, assignment.value());
    }
    push_where::<T>(&mut qb, spec, None);
    qb
}

fn savepoint_name(name: &str) -> Result<String, RepoError> {
    if name.is_empty() {
        return Err(RepoError::invalid_input("savepoint name must not be empty"));
    }
    Ok(quote_ident(name))
}

pub(super) fn savepoint(name: &str) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    Ok(QueryBuilder::new(format!("SAVEPOINT {}", savepoint_name(name)?)))
}

pub(super) fn rollback_to(name: &str) -> Result<QueryBuilder<'static, Postgres>, RepoError> {
    Ok(QueryBuilder::new(format!(
        "ROLLBACK TO SAVEPOINT {}",
        savepoint_name(name)?
    )))
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use time::macros::datetime;

    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        id: i64,
        email: String,
        deleted_at: Option<OffsetDateTime>,
    }

    impl Entity for Account {
        const TABLE: &'static str = "accounts";
        const COLUMNS: &'static [&'static str] = &["id", "email", "deleted_at"];
        const SOFT_DELETE: Option<&'static str> = Some("deleted_at");

        fn primary_key(&self) -> Value {
            self.id.into()
        }

        fn column(&self, name: &str) -> Option<Value> {
            match name {
                "id" => Some(self.id.into()),
                "email" => Some(self.email.clone().into()),
                "deleted_at" => Some(self.deleted_at.into()),
                _ => None,
            }
        }
    }

    fn account(id: i64) -> Account {
        Account {
            id,
            email: format!("{id}@example.com"),
            deleted_at: None,
        }
    }

    #[test]
    fn select_scopes_filters_orders_and_pages() {
        let spec = QuerySpec {
            conditions: vec![Condition::like("email", "%@example.com")],
            orders: vec![OrderExpr::desc("email")],
            offset: Some(20),
            limit: Some(10),
            unscoped: false,
        };
        let qb = select::<Account>(&spec, Some(OrderExpr::asc("id")));
        assert_eq!(
            qb.sql(),
            "SELECT to_jsonb(t) FROM \"accounts\" AS t WHERE \"deleted_at\" IS NULL \
             AND \"email\" LIKE $1 ORDER BY \"email\" DESC, \"id\" ASC LIMIT $2 OFFSET $3"
        );
    }

    #[test]
    fn unscoped_count_has_no_where() {
        let spec = QuerySpec {
            unscoped: true,
            ..Default::default()
        };
        assert_eq!(
            count::<Account>(&spec).sql(),
            "SELECT COUNT(*) FROM \"accounts\" AS t"
        );
    }

    #[test]
    fn upsert_updates_every_non_key_column() {
        let qb = insert(&[account(1), account(2)], true).expect("statement");
        assert_eq!(
            qb.sql(),
            "INSERT INTO \"accounts\" (\"id\", \"email\", \"deleted_at\") VALUES \
             ($1, $2, NULL), ($3, $4, NULL) ON CONFLICT (\"id\") DO UPDATE SET \
             \"email\" = EXCLUDED.\"email\", \"deleted_at\" = EXCLUDED.\"deleted_at\""
        );
    }

    #[test]
    fn soft_delete_updates_timestamp() {
        let keys = [Value::Int(1), Value::Int(2)];
        let qb = delete::<Account>(
            &QuerySpec::default(),
            Some(&keys[..]),
            datetime!(2024-01-01 0:00 UTC),
        );
        assert_eq!(
            qb.sql(),
            "UPDATE \"accounts\" SET \"deleted_at\" = $1 WHERE \"deleted_at\" IS NULL \
             AND \"id\" IN ($2, $3)"
        );
    }

    #[test]
    fn update_sets_columns_on_scoped_rows() {
        let spec = QuerySpec {
            conditions: vec![Condition::eq("id", 7_i64)],
            ..Default::default()
        };
        let qb = update::<Account>(
            &spec,
            &[
                Assignment::new("email", "new@example.com"),
                Assignment::new("deleted_at", None::<OffsetDateTime>),
            ],
        );
        assert_eq!(
            qb.sql(),
            "UPDATE \"accounts\" SET \"email\" = $1, \"deleted_at\" = NULL \
             WHERE \"deleted_at\" IS NULL AND \"id\" = $2"
        );
    }

    #[test]
    fn savepoints_quote_their_names() {
        assert_eq!(savepoint("before_chunk").expect("sql").sql(), "SAVEPOINT \"before_chunk\"");
        assert_eq!(
            rollback_to("before_chunk").expect("sql").sql(),
            "ROLLBACK TO SAVEPOINT \"before_chunk\""
        );
        assert!(savepoint("").is_err());
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let spec = QuerySpec {
            conditions: vec![Condition::in_list("id", Vec::<i64>::new())],
            unscoped: true,
            ..Default::default()
        };
        assert!(count::<Account>(&spec).sql().ends_with("WHERE FALSE"));
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
