//! Database module for SQLite snapshot and live restore operations

use std::path::PathBuf;

pub mod backup;
pub mod config_store;
pub mod drain;
pub mod gate;
pub mod lock;
pub mod paths;
pub mod restore;

/// Default SQLite database file path
pub const DATABASE_PATH: &str = "db.sqlite";

/// Configuration key holding the active connection string
pub const DATABASE_URL_KEY: &str = "DATABASE_URL";

/// Database error type for backup/restore operations
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Backup file not found or not a regular file: {}", .0.display())]
    BackupNotFound(PathBuf),

    #[error("Failed to copy {} to {}: {error}", .backup.display(), .target.display())]
    Copy {
        backup: PathBuf,
        target: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Failed to write configuration {}: {reason}", .path.display())]
    ConfigWrite { path: PathBuf, reason: String },
}

impl From<sqlx::Error> for DatabaseError {
    fn from(error: sqlx::Error) -> Self {
        DatabaseError::Sqlite(error.to_string())
    }
}

/// Result type for database operations
pub type Result<T> = std::result::Result<T, DatabaseError>;
