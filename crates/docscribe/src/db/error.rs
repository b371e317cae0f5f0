//! Errors raised by the persistence layer.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("Cannot prepare database directory '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration {version} failed: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored value no longer decodes, e.g. an unknown status string.
    #[error("Corrupt value in column '{column}': {value}")]
    Corrupt { column: &'static str, value: String },

    /// A guarded write matched no row.
    #[error("Constraint violated: {0}")]
    Constraint(String),

    #[error("Database lock poisoned")]
    LockPoisoned,
}
