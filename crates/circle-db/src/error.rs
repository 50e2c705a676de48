use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("a user cannot form a relationship with themselves")]
    SelfRelation,

    /// A unique key was already taken; carries a human-readable reason.
    #[error("{0}")]
    Conflict(&'static str),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// True when an insert or update tripped a UNIQUE or PRIMARY KEY constraint.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Map a unique-constraint failure to `DbError::Conflict`, anything else to `Sqlite`.
pub(crate) fn conflict_or(err: rusqlite::Error, reason: &'static str) -> DbError {
    if is_unique_violation(&err) {
        DbError::Conflict(reason)
    } else {
        DbError::Sqlite(err)
    }
}
