//! # Store Errors
//!
//! ```text
//! sqlx::Error ──► DbError ──► SyncError::Database (fleet-sync)
//!
//!   RowNotFound               NotFound     dedup checks read this as "absent"
//!   UNIQUE constraint failed  Duplicate    a command UUID recorded twice
//!   ColumnDecode              CorruptRow   e.g. an unknown status string
//!   PoolTimedOut / PoolClosed Unavailable  transient; the loop tries again
//!   anything else             Sqlite
//! ```

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A row with this key already exists.
    #[error("{field} '{value}' already recorded")]
    Duplicate { field: String, value: String },

    /// The store could not be opened or no connection was free.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    /// A stored value does not map onto a domain type.
    #[error("Corrupt column {column}: {reason}")]
    CorruptRow { column: String, reason: String },

    #[error("SQLite error: {0}")]
    Sqlite(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::NotFound { .. })
    }

    /// Worth retrying on the next loop iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("Row", "?"),
            sqlx::Error::Database(db_err) => match db_err.message().strip_prefix("UNIQUE constraint failed: ") {
                // The caller knows the offending key; it fills in `value`.
                Some(field) => DbError::Duplicate {
                    field: field.to_string(),
                    value: String::new(),
                },
                None => DbError::Sqlite(db_err.message().to_string()),
            },
            sqlx::Error::ColumnDecode { index, source } => DbError::CorruptRow {
                column: index,
                reason: source.to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => DbError::Unavailable(err.to_string()),
            other => DbError::Sqlite(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::Migration(err.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_row_is_not_found() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_pool_exhaustion_is_transient() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
        assert!(matches!(err, DbError::Unavailable(_)));
    }
}
