//! Error types for catalog operations.

use std::fmt;

use thiserror::Error;

/// Structured classification for catalog/database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogErrorKind {
    /// SQLite returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Filesystem or transport IO failure.
    Io,
    /// Unclassified database failure.
    Other,
}

impl CatalogErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Database(database_error) => {
                let code = database_error.code();
                if matches!(code.as_deref(), Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")) {
                    Self::BusyOrLocked
                } else if database_error.is_unique_violation()
                    || database_error.is_foreign_key_violation()
                    || database_error.is_check_violation()
                    || code
                        .as_deref()
                        .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
                {
                    Self::ConstraintViolation
                } else {
                    Self::Other
                }
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for CatalogErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::Io => "io",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

/// Errors that can occur during catalog operations.
///
/// Any of these is fatal to the engine: a store that rejects reads or writes
/// cannot record progress, so the scheduler shuts down rather than keep
/// downloading into the void.
#[derive(Debug, Clone, Error)]
pub enum CatalogError {
    /// Database operation failed.
    #[error("catalog write rejected ({kind}): {message}")]
    Database {
        /// Typed classification for failure handling.
        kind: CatalogErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// No transfer exists with the given id.
    #[error("transfer not found: id {0}")]
    TransferNotFound(i64),
}

impl From<sqlx::Error> for CatalogError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: CatalogErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl CatalogError {
    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<CatalogErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::TransferNotFound(_) => None,
        }
    }
}
