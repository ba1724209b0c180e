//! Filter conditions, ordering and the accumulated query state of a handle.

use time::OffsetDateTime;

use super::RepoError;
use super::entity::{Entity, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
    In,
    IsNull,
    NotNull,
}

impl Op {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::IsNull => "IS NULL",
            Self::NotNull => "IS NOT NULL",
        }
    }
}

/// A single `column <op> value(s)` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    column: String,
    op: Op,
    values: Vec<Value>,
}

impl Condition {
    fn binary(column: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            values: vec![value.into()],
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::binary(column, Op::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::binary(column, Op::Ne, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::binary(column, Op::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::binary(column, Op::Ge, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::binary(column, Op::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::binary(column, Op::Le, value)
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::binary(column, Op::Like, Value::Text(pattern.into()))
    }

    pub fn in_list<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            column: column.into(),
            op: Op::In,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: Op::IsNull,
            values: Vec::new(),
        }
    }

    pub fn not_null(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: Op::NotNull,
            values: Vec::new(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Evaluates the predicate against an in-memory row. Unknown columns never match.
    pub fn matches<T: Entity>(&self, row: &T) -> bool {
        let Some(actual) = row.column(&self.column) else {
            return false;
        };
        let expected = self.values.first();
        match self.op {
            Op::IsNull => actual.is_null(),
            Op::NotNull => !actual.is_null(),
            Op::In => self.values.iter().any(|value| actual.sql_eq(value)),
            Op::Like => match expected {
                Some(Value::Text(pattern)) => actual.like(pattern),
                _ => false,
            },
            op => {
                let Some(expected) = expected else {
                    return false;
                };
                if actual.is_null() || expected.is_null() {
                    return false;
                }
                let ordering = actual.compare(expected);
                match op {
                    Op::Eq => ordering.is_eq(),
                    Op::Ne => ordering.is_ne(),
                    Op::Gt => ordering.is_gt(),
                    Op::Ge => ordering.is_ge(),
                    Op::Lt => ordering.is_lt(),
                    _ => ordering.is_le(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderExpr {
    column: String,
    descending: bool,
}

impl OrderExpr {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: false,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            descending: true,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn is_descending(&self) -> bool {
        self.descending
    }
}

/// One `column = value` pair of a partial update.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    column: String,
    value: Value,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}

/// Query state carried by a repository handle.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub conditions: Vec<Condition>,
    pub orders: Vec<OrderExpr>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub unscoped: bool,
}

impl QuerySpec {
    /// Whether `row` passes every condition and the soft-delete scope.
    pub fn admits<T: Entity>(&self, row: &T) -> bool {
        (self.unscoped || !row.is_deleted())
            && self.conditions.iter().all(|condition| condition.matches(row))
    }

    /// Rejects updates that would touch every row, the primary key, or a
    /// column `T` does not persist.
    pub fn check_update<T: Entity>(&self, assignments: &[Assignment]) -> Result<(), RepoError> {
        if self.conditions.is_empty() {
            return Err(RepoError::invalid_input("refusing to update without conditions"));
        }
        for assignment in assignments {
            let column = assignment.column();
            if column == T::PRIMARY_KEY {
                return Err(RepoError::invalid_input(format!(
                    "{}: primary key `{column}` cannot be updated",
                    T::TABLE
                )));
            }
            if !T::COLUMNS.contains(&column) {
                return Err(RepoError::invalid_input(format!(
                    "{} has no column `{column}`",
                    T::TABLE
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Optional filters
// ============================================================================

/// `column = value` when `value` is present.
pub fn optional<V: Into<Value>>(column: &str, value: Option<V>) -> Option<Condition> {
    value.map(|value| Condition::eq(column, value))
}

/// `column = value` when `value` is non-zero.
pub fn non_zero(column: &str, value: i64) -> Option<Condition> {
    (value != 0).then(|| Condition::eq(column, value))
}

/// `column = text` when `text` is non-empty.
pub fn text(column: &str, text: &str) -> Option<Condition> {
    (!text.is_empty()).then(|| Condition::eq(column, text))
}

/// `column LIKE %fuzz%` when `fuzz` is non-empty.
pub fn fuzzy(column: &str, fuzz: &str) -> Option<Condition> {
    (!fuzz.is_empty()).then(|| Condition::like(column, format!("%{fuzz}%")))
}

/// `column = v` for one value, `column IN (...)` for several, nothing for none.
pub fn one_or_many<V>(column: &str, values: &[V]) -> Option<Condition>
where
    V: Clone + Into<Value>,
{
    match values {
        [] => None,
        [single] => Some(Condition::eq(column, single.clone())),
        many => Some(Condition::in_list(column, many.iter().cloned())),
    }
}

/// Inclusive bounds on a timestamp column; absent bounds add nothing.
pub fn time_range(
    column: &str,
    start: Option<OffsetDateTime>,
    end: Option<OffsetDateTime>,
) -> Vec<Condition> {
    start
        .map(|start| Condition::ge(column, start))
        .into_iter()
        .chain(end.map(|end| Condition::le(column, end)))
        .collect()
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn optional_helpers_skip_empty_inputs() {
        assert!(optional::<i64>("age", None).is_none());
        assert!(non_zero("age", 0).is_none());
        assert!(text("account", "").is_none());
        assert!(fuzzy("nick_name", "").is_none());
        assert!(one_or_many::<i64>("id", &[]).is_none());
    }

    #[test]
    fn one_or_many_picks_operator() {
        assert_eq!(one_or_many("id", &[1_i64]).map(|c| c.op()), Some(Op::Eq));
        let many = one_or_many("id", &[1_i64, 2, 3]).expect("condition");
        assert_eq!(many.op(), Op::In);
        assert_eq!(many.values().len(), 3);
    }

    #[test]
    fn fuzzy_wraps_pattern() {
        let condition = fuzzy("nick_name", "bob").expect("condition");
        assert_eq!(condition.values(), &[Value::from("%bob%")]);
    }

    #[test]
    fn time_range_includes_present_bounds() {
        let start = datetime!(2024-01-01 0:00 UTC);
        let end = datetime!(2024-02-01 0:00 UTC);
        assert_eq!(time_range("created_at", None, None).len(), 0);
        let both = time_range("created_at", Some(start), Some(end));
        assert_eq!(both.iter().map(Condition::op).collect::<Vec<_>>(), vec![Op::Ge, Op::Le]);
    }
}
