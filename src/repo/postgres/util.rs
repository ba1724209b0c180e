use sqlx::error::DatabaseError;

use crate::repo::RepoError;

// SQLSTATE codes, see the Postgres "Error Codes" appendix.
const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";
const QUERY_CANCELED: &str = "57014";
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const DATA_EXCEPTION_CLASS: &str = "22";
const INTEGRITY_CLASS: &str = "23";

pub fn map_sqlx_error(err: sqlx::Error) -> RepoError {
    match err {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::PoolTimedOut => RepoError::Timeout,
        sqlx::Error::PoolClosed => RepoError::Persistence("connection pool is closed".into()),
        sqlx::Error::Io(err) => RepoError::Persistence(format!("database i/o failed: {err}")),
        sqlx::Error::Database(db) => map_database_error(db.as_ref()),
        sqlx::Error::Decode(err) => RepoError::Persistence(format!("row decode failed: {err}")),
        other => RepoError::from_persistence(other),
    }
}

fn map_database_error(db: &dyn DatabaseError) -> RepoError {
    let code = db.code().map(|code| code.into_owned()).unwrap_or_default();
    match code.as_str() {
        UNIQUE_VIOLATION => RepoError::Duplicate {
            constraint: db.constraint().unwrap_or("unknown").to_string(),
        },
        FOREIGN_KEY_VIOLATION => RepoError::invalid_input(db.message()),
        QUERY_CANCELED => RepoError::Timeout,
        SERIALIZATION_FAILURE | DEADLOCK_DETECTED => RepoError::transaction(db.message()),
        code if code.starts_with(DATA_EXCEPTION_CLASS) => RepoError::invalid_input(db.message()),
        code if code.starts_with(INTEGRITY_CLASS) => RepoError::Integrity {
            message: db.message().to_string(),
        },
        "" => RepoError::Persistence(db.message().to_string()),
        code => RepoError::Persistence(format!("{} (SQLSTATE {code})", db.message())),
    }
}
