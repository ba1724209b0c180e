//! Entity metadata and dynamically typed column values.

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use uuid::Uuid;

use super::RepoError;

/// A record stored in one table.
///
/// The repository layer reads rows only through this trait: table and column
/// names for statement building, and [`Entity::column`] for filtering and
/// ordering in memory.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const TABLE: &'static str;
    const PRIMARY_KEY: &'static str = "id";
    /// Every persisted column, primary key included.
    const COLUMNS: &'static [&'static str];
    /// Timestamp column set by soft deletes; `None` means deletes are hard.
    const SOFT_DELETE: Option<&'static str> = None;

    fn primary_key(&self) -> Value;

    fn column(&self, name: &str) -> Option<Value>;

    /// Stamp the soft-delete column. Only called when `SOFT_DELETE` is set.
    fn mark_deleted(&mut self, _at: OffsetDateTime) {}

    /// Overwrite one column in memory, for partial updates.
    ///
    /// The default round-trips the row through its serde form, so it expects
    /// each column to serialize as a field of the same name. Override it for
    /// entities that rename or flatten fields.
    fn set_column(&mut self, name: &str, value: &Value) -> Result<(), RepoError> {
        let invalid = |reason: String| {
            RepoError::invalid_input(format!("{}.{name}: {reason}", Self::TABLE))
        };

        let mut fields = match serde_json::to_value(&*self) {
            Ok(JsonValue::Object(fields)) => fields,
            Ok(_) => return Err(invalid("row does not serialize as an object".into())),
            Err(err) => return Err(invalid(err.to_string())),
        };
        if !fields.contains_key(name) {
            return Err(invalid("no such field".into()));
        }
        let json = value.to_json().map_err(|err| invalid(err.to_string()))?;
        fields.insert(name.to_owned(), json);
        *self = serde_json::from_value(JsonValue::Object(fields))
            .map_err(|err| invalid(err.to_string()))?;
        Ok(())
    }

    fn is_deleted(&self) -> bool {
        Self::SOFT_DELETE
            .and_then(|column| self.column(column))
            .is_some_and(|value| !value.is_null())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(OffsetDateTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Total order used for sorting: `Null` first, integers and floats
    /// compared numerically, mismatched kinds by kind.
    pub fn compare(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.total_cmp(b),
            (Int(a), Float(b)) => (*a as f64).total_cmp(b),
            (Float(a), Int(b)) => a.total_cmp(&(*b as f64)),
            (Text(a), Text(b)) => a.cmp(b),
            (Uuid(a), Uuid(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    /// SQL equality: `NULL` equals nothing.
    pub fn sql_eq(&self, other: &Self) -> bool {
        !self.is_null() && !other.is_null() && self.compare(other) == Ordering::Equal
    }

    /// SQL `LIKE` with `%` and `_` wildcards, case-sensitive.
    pub fn like(&self, pattern: &str) -> bool {
        match self {
            Self::Text(text) => like_match(text, pattern),
            _ => false,
        }
    }

    /// The value in the shape serde gives the matching Rust type.
    pub fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            Self::Null => Ok(JsonValue::Null),
            Self::Bool(value) => Ok((*value).into()),
            Self::Int(value) => Ok((*value).into()),
            Self::Float(value) => Ok((*value).into()),
            Self::Text(value) => Ok(value.clone().into()),
            Self::Uuid(value) => serde_json::to_value(value),
            Self::Timestamp(value) => serde_json::to_value(value),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 2,
            Self::Text(_) => 3,
            Self::Uuid(_) => 4,
            Self::Timestamp(_) => 5,
        }
    }
}

/// Two-pointer matcher over characters. On a mismatch after a `%`, the match
/// resumes one character past where that `%` last started.
fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut resume: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p).copied() {
            Some('%') => {
                resume = Some((p, t));
                p += 1;
            }
            Some(c) if c == '_' || c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match resume {
                Some((star, start)) => {
                    p = star + 1;
                    t = start + 1;
                    resume = Some((star, start + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(value) => write!(f, "{value}"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
            Self::Uuid(value) => write!(f, "{value}"),
            Self::Timestamp(value) => write!(f, "{value}"),
        }
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

macro_rules! value_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for Value {
            fn from(value: $ty) -> Self {
                Self::$variant(value.into())
            }
        })*
    };
}

value_from! {
    bool => Bool,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => Text,
    Uuid => Uuid,
    OffsetDateTime => Timestamp,
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}
